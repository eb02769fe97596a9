use clap::{CommandFactory, Parser};

use crate::cli::{Cli, DialectCli, OutputModeCli};

mod cli;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        let bin_name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        return;
    }

    let Some(path) = cli.path else {
        let _ = Cli::command().print_help();
        std::process::exit(1);
    };

    let options = decmb_lib::DecompileOptions {
        mode: match cli.mode {
            OutputModeCli::Pseudo => decmb_lib::OutputMode::Pseudo,
            OutputModeCli::Disasm => decmb_lib::OutputMode::Disasm,
        },
        dialect: match cli.dialect {
            DialectCli::A => decmb_lib::Dialect::A,
            DialectCli::B => decmb_lib::Dialect::B,
        },
        split_branch_keeps: cli.split_branch_keeps,
    };

    match std::fs::read(&path) {
        Ok(bytes) => match decmb_lib::decompile_with_options(&bytes, options) {
            Ok(out) => {
                print!("{out}");
            }
            Err(e) => {
                eprintln!("decompile error: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("failed to read {path:?}: {e}");
            std::process::exit(1);
        }
    }
}
