use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "filingqc",
    version,
    about = "Financial filing extraction QC and quarter derivation tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Validate(ValidateArgs),
    Compile(CompileArgs),
    Qc(QcArgs),
    Derive(DeriveArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StatementKind {
    Pl,
    Bs,
    Cf,
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pl => "pl",
            Self::Bs => "bs",
            Self::Cf => "cf",
        }
    }

    pub fn all() -> [Self; 3] {
        [Self::Pl, Self::Bs, Self::Cf]
    }
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[arg(long, default_value = ".cache/filingqc")]
    pub cache_root: PathBuf,

    #[arg(long, value_enum, default_value_t = StatementKind::Pl)]
    pub statement: StatementKind,

    #[arg(long)]
    pub ticker: Option<String>,

    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompileArgs {
    #[arg(long, default_value = ".cache/filingqc")]
    pub cache_root: PathBuf,

    #[arg(long, value_enum, default_value_t = StatementKind::Pl)]
    pub statement: StatementKind,

    #[arg(long)]
    pub ticker: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct QcArgs {
    #[arg(long, default_value = ".cache/filingqc")]
    pub cache_root: PathBuf,

    #[arg(long, value_enum, default_value_t = StatementKind::Pl)]
    pub statement: StatementKind,

    #[arg(long)]
    pub ticker: Option<String>,

    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DeriveArgs {
    #[arg(long, default_value = ".cache/filingqc")]
    pub cache_root: PathBuf,

    #[arg(long, value_enum, default_value_t = StatementKind::Pl)]
    pub statement: StatementKind,

    #[arg(long)]
    pub ticker: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/filingqc")]
    pub cache_root: PathBuf,
}
