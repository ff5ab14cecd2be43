//! Interactive REPL for poking at an `Engine<i64, i64>` instance.
//!
//! `clap` parses the one-shot startup flags, `rustyline` drives the
//! read-eval-print loop, and `nom` parses each line into a `Command`.

use clap::Parser;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{i64 as parse_i64, space1, u32 as parse_u32, u64 as parse_u64};
use nom::combinator::{map, value};
use nom::sequence::{preceded, tuple};
use nom::IResult;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use lsm_sampler::{DeleteMode, Engine, EngineOptions, IndexKind, Policy, SampleMode};

#[derive(Parser, Debug)]
#[command(name = "lsm-sampler-cli", about = "REPL over an in-memory sampling LSM engine")]
struct Args {
    #[arg(long, default_value_t = 1024)]
    memtable_capacity: usize,

    #[arg(long, default_value_t = 256)]
    memtable_tombstone_capacity: usize,

    #[arg(long, default_value_t = 2)]
    scale_factor: usize,

    #[arg(long, value_enum, default_value = "leveling")]
    policy: PolicyArg,

    #[arg(long, value_enum, default_value = "uniform")]
    sample_mode: SampleModeArg,

    #[arg(long, value_enum, default_value = "cancel")]
    delete_mode: DeleteModeArg,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum PolicyArg {
    Leveling,
    Tiering,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum SampleModeArg {
    Uniform,
    Wirs,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum DeleteModeArg {
    Cancel,
    Tag,
}

enum Command {
    Put { key: i64, value: i64, weight: u32 },
    Get { key: i64 },
    Delete { key: i64, value: i64 },
    Range { lower: i64, upper: i64, count: u64 },
    Stats,
    Help,
    Quit,
}

fn parse_put(input: &str) -> IResult<&str, Command> {
    map(
        tuple((
            tag("put"),
            preceded(space1, parse_i64),
            preceded(space1, parse_i64),
            nom::combinator::opt(preceded(space1, parse_u32)),
        )),
        |(_, key, value, weight)| Command::Put {
            key,
            value,
            weight: weight.unwrap_or(1),
        },
    )(input)
}

fn parse_get(input: &str) -> IResult<&str, Command> {
    map(preceded(tuple((tag("get"), space1)), parse_i64), |key| {
        Command::Get { key }
    })(input)
}

fn parse_delete(input: &str) -> IResult<&str, Command> {
    map(
        tuple((
            tag("delete"),
            preceded(space1, parse_i64),
            preceded(space1, parse_i64),
        )),
        |(_, key, value)| Command::Delete { key, value },
    )(input)
}

fn parse_range(input: &str) -> IResult<&str, Command> {
    map(
        tuple((
            tag("range"),
            preceded(space1, parse_i64),
            preceded(space1, parse_i64),
            preceded(space1, parse_u64),
        )),
        |(_, lower, upper, count)| Command::Range { lower, upper, count },
    )(input)
}

fn parse_command(input: &str) -> IResult<&str, Command> {
    alt((
        parse_put,
        parse_get,
        parse_delete,
        parse_range,
        value(Command::Stats, tag("stats")),
        value(Command::Help, tag("help")),
        value(Command::Quit, alt((tag("quit"), tag("exit")))),
    ))(input)
}

fn engine_options(args: &Args) -> EngineOptions {
    EngineOptions {
        memtable_capacity: args.memtable_capacity,
        memtable_tombstone_capacity: args.memtable_tombstone_capacity,
        memtable_count: 2,
        scale_factor: args.scale_factor,
        policy: match args.policy {
            PolicyArg::Leveling => Policy::Leveling,
            PolicyArg::Tiering => Policy::Tiering,
        },
        tombstone_fraction: 0.2,
        bloom_fpr: 0.01,
        bloom_hash_functions: 7,
        sample_mode: match args.sample_mode {
            SampleModeArg::Uniform => SampleMode::Uniform,
            SampleModeArg::Wirs => SampleMode::Wirs,
        },
        delete_mode: match args.delete_mode {
            DeleteModeArg::Cancel => DeleteMode::Cancel,
            DeleteModeArg::Tag => DeleteMode::Tag,
        },
        index_kind: IndexKind::Isam,
        max_cascade_depth: None,
    }
}

fn print_help() {
    println!("commands:");
    println!("  put <key> <value> [weight]   insert or overwrite a record");
    println!("  get <key>                    point lookup");
    println!("  delete <key> <value>         tombstone a record");
    println!("  range <lower> <upper> <k>    draw k samples from [lower, upper]");
    println!("  stats                        engine-wide counters");
    println!("  help, quit");
}

fn main() -> anyhow::Result<()> {
    lsm_sampler::init_tracing();
    let args = Args::parse();
    let engine: Engine<i64, i64> = Engine::open(engine_options(&args))?;

    let mut rl = DefaultEditor::new()?;
    print_help();

    loop {
        match rl.readline("lsm-sampler> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(trimmed);
                match parse_command(trimmed) {
                    Ok((_, Command::Put { key, value, weight })) => match engine.append(key, value, weight) {
                        Ok(()) => println!("ok"),
                        Err(err) => println!("error: {err}"),
                    },
                    Ok((_, Command::Get { key })) => match engine.get(key) {
                        Some(value) => println!("{value}"),
                        None => println!("(not found)"),
                    },
                    Ok((_, Command::Delete { key, value })) => match engine.delete(key, value) {
                        Ok(()) => println!("ok"),
                        Err(err) => println!("error: {err}"),
                    },
                    Ok((_, Command::Range { lower, upper, count })) => {
                        match engine.range_sample(lower, upper, count as usize) {
                            Ok(samples) => {
                                for (k, v) in samples {
                                    println!("{k}\t{v}");
                                }
                            }
                            Err(err) => println!("error: {err}"),
                        }
                    }
                    Ok((_, Command::Stats)) => {
                        println!("records: {}", engine.record_count());
                        println!("tombstones: {}", engine.tombstone_count());
                        println!("levels: {}", engine.height());
                        println!("active pins: {}", engine.active_pin_count());
                        println!("memtable utilization: {:.2}", engine.memory_utilization());
                    }
                    Ok((_, Command::Help)) => print_help(),
                    Ok((_, Command::Quit)) => break,
                    Err(_) => println!("unrecognized command; try `help`"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                tracing::error!(?err, "readline error");
                break;
            }
        }
    }

    Ok(())
}
