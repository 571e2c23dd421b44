// File: src/main.rs
//
// Console reference driver for the Spool dialogue runtime.
// Loads a compiled module, pumps the VM, prints lines, prompts for
// option choices on stdin, and feeds wall-clock milliseconds to the VM
// clock so scripted waits work.

use clap::Parser as ClapParser;
use spool::errors::DialogueError;
use spool::runner::{DialogueHost, PresentedOption, YarnRunner};
use spool::vm::{RunningState, VmSettings};
use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};

#[derive(ClapParser)]
#[command(
    name = "spool",
    about = "Run a compiled Yarn dialogue module in the console",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Module to run; expects <module>.yarnc, <module>-Lines.csv and
    /// <module>-Metadata.csv
    module: String,

    /// Node to start execution from
    #[arg(long, default_value = "Start")]
    start_node: String,

    /// Seed for the script-visible random number generator
    #[arg(long)]
    seed: Option<u64>,

    /// Log and skip script errors instead of stopping on them
    #[arg(long)]
    lax: bool,
}

/// Console presentation: lines to stdout, option selection from stdin.
struct ConsoleHost;

impl DialogueHost for ConsoleHost {
    fn on_text(&mut self, text: &str) {
        print!("{}", text);
    }

    fn on_line_end(&mut self) {
        println!();
    }

    fn on_options(&mut self, options: &[PresentedOption]) -> Option<usize> {
        for option in options {
            if option.enabled {
                println!("\t{}) {}", option.index + 1, option.text);
            }
        }

        let stdin = io::stdin();
        loop {
            print!("> ");
            let _ = io::stdout().flush();

            let mut input = String::new();
            match stdin.lock().read_line(&mut input) {
                // Give up on EOF or a read error; the dialogue stays
                // awaiting input.
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }

            match input.trim().parse::<usize>() {
                Ok(choice) if choice >= 1 && choice <= options.len() => {
                    let index = choice - 1;
                    if options[index].enabled {
                        return Some(index);
                    }
                    println!("That choice is not available.");
                }
                _ => println!("Enter a number between 1 and {}.", options.len()),
            }
        }
    }

    fn on_unknown_command(&mut self, command: &str) {
        eprintln!("unhandled command: {}", command);
    }
}

fn main() {
    let cli = Cli::parse();

    let mut settings = VmSettings::default();
    if let Some(seed) = cli.seed {
        settings.random_seed = seed;
    }
    settings.enable_exceptions = !cli.lax;

    let mut runner = YarnRunner::new(settings);
    let mut host = ConsoleHost;

    if let Err(err) = run(&mut runner, &mut host, &cli) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

/// Load the module and run the cooperative loop: process instructions
/// while the VM runs, tick the clock while it sleeps, and finish when it
/// stops.
fn run(runner: &mut YarnRunner, host: &mut ConsoleHost, cli: &Cli) -> Result<(), DialogueError> {
    runner.load_module(&cli.module, &cli.start_node, host)?;

    let mut last_tick = Instant::now();

    loop {
        let now = Instant::now();
        let dt = now.duration_since(last_tick).as_millis() as i64;
        if dt > 0 {
            runner.vm.increment_time(dt);
            last_tick = now;
        }

        match runner.vm.state() {
            RunningState::Running => runner.continue_dialogue(host)?,
            RunningState::Asleep => std::thread::sleep(Duration::from_millis(1)),
            RunningState::Stopped | RunningState::AwaitingInput => return Ok(()),
        }
    }
}
