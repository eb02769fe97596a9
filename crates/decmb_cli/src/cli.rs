use std::path::PathBuf;

use clap::{Parser, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputModeCli {
    Pseudo,
    Disasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialectCli {
    /// Extended ISA (wide CALL operands, read-modify-write opcodes)
    A,
    /// Base ISA
    B,
}

#[derive(Parser)]
#[command(name = "decmb",
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    /// Path to the CMB script container
    pub path: Option<PathBuf>,

    /// Output mode
    #[arg(long, value_enum, default_value_t = OutputModeCli::Pseudo)]
    pub mode: OutputModeCli,

    /// Bytecode dialect of the container
    #[arg(long, value_enum, default_value_t = DialectCli::A)]
    pub dialect: DialectCli,

    /// Treat branch-and-keep opcodes as ordinary jumps when slicing (debug)
    #[arg(long, default_value_t = false)]
    pub split_branch_keeps: bool,

    /// Generate shell completion and exit
    #[arg(long, value_enum)]
    pub completions: Option<Shell>,
}
