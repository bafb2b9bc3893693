use clap::Parser;

use gramsat::formula::{exists_bind, forall, forall_bind, smt_eq, Variable};
use gramsat::grammar::Grammar;
use gramsat::pattern::MatchPattern;
use gramsat::predicate::before;
use gramsat::smt::StringTerm;
use gramsat::solver::{top_constant, Solver, SolverConfig};

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Number of solutions to generate.
    #[arg(value_name = "INT", default_value = "10")]
    solutions: usize,

    /// Cap on default expansions per solution.
    #[clap(long, value_name = "INT", default_value = "10")]
    max_free: usize,

    /// Use an external `z3` process instead of the builtin fallback solver.
    #[clap(long)]
    z3: bool,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let args = Cli::parse();
    println!("args = {:?}", args);

    let grammar = Grammar::new(
        "start",
        [
            ("start", vec!["<stmt>"]),
            ("stmt", vec!["<assgn>", "<assgn> ; <stmt>"]),
            ("assgn", vec!["<var> := <rhs>"]),
            ("rhs", vec!["<var>", "<digit>"]),
            ("var", vec!["x", "y", "z"]),
            ("digit", vec!["0", "1", "2"]),
        ],
    )?;
    println!("grammar:\n{}", grammar);

    // "Every right-hand-side variable has an earlier assignment":
    //
    //   forall "{lhs_1} := {rhs_1}" = assgn_1 in start:
    //     forall <var> var in rhs_1:
    //       exists "{lhs_2} := {rhs_2}" = assgn_2 in start:
    //         before(assgn_2, assgn_1) and lhs_2 == var
    let lhs_2 = Variable::new("lhs_2", "var");
    let assgn_1 = Variable::new("assgn_1", "assgn");
    let assgn_2 = Variable::new("assgn_2", "assgn");
    let var = Variable::new("var", "var");
    let formula = forall_bind(
        MatchPattern::parse("{<var> lhs_1} := {<rhs> rhs_1}")?,
        assgn_1.clone(),
        top_constant(&grammar),
        forall(
            var.clone(),
            Variable::new("rhs_1", "rhs"),
            exists_bind(
                MatchPattern::parse("{<var> lhs_2} := {<rhs> rhs_2}")?,
                assgn_2.clone(),
                top_constant(&grammar),
                gramsat::formula::conj([
                    before(assgn_2, assgn_1),
                    smt_eq(StringTerm::var(&lhs_2), StringTerm::var(&var)),
                ]),
            ),
        ),
    );
    println!("formula: {}", formula);

    let config = SolverConfig {
        max_free_instantiations: args.max_free,
        ..SolverConfig::default()
    };
    let mut solver = if args.z3 {
        Solver::with_z3(grammar, formula, config)?
    } else {
        Solver::new(grammar, formula, config)?
    };

    for (i, solution) in solver.solutions().take(args.solutions).enumerate() {
        println!("[{}] {}", i + 1, solution.text);
    }

    let elapsed = time_total.elapsed();
    println!("done in {:.3}s", elapsed.as_secs_f64());
    Ok(())
}
