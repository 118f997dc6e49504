use clap::{Args, ValueEnum};

/// Which of the three execution strategies drives the CPU
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, ValueEnum)]
pub enum EngineKind {
    /// Decode and execute one instruction at a time
    Interpreter,
    /// Decode each 4KB page once and dispatch over the decoded records
    #[default]
    Cached,
    /// Translate pages into host code with a register cache
    Recompiler,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Interpreter => write!(f, "interpreter"),
            EngineKind::Cached => write!(f, "cached"),
            EngineKind::Recompiler => write!(f, "recompiler"),
        }
    }
}

#[derive(Debug, Args)]
#[clap(next_help_heading = "Global Options")]
pub struct GlobalOpts {
    /// Execution strategy
    #[arg(long, short, value_enum, default_value_t = EngineKind::Cached)]
    pub engine: EngineKind,

    /// Count register increments per executed instruction
    #[arg(long, default_value_t = 2)]
    pub count_per_op: u32,

    /// Number of Count cycles to run before stopping
    #[arg(long, default_value_t = 10_000_000)]
    pub cycles: u32,

    /// Virtual address execution starts at
    #[arg(long, value_parser = parse_hex, default_value = "0xa4000040")]
    pub entry: u32,

    /// Compiled pages kept before the translation cache is flushed
    #[arg(long, default_value_t = 4096)]
    pub max_pages: usize,
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid address {}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        global: GlobalOpts,
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["r4300-mu"]);
        assert_eq!(cli.global.engine, EngineKind::Cached);
        assert_eq!(cli.global.count_per_op, 2);
        assert_eq!(cli.global.entry, 0xa400_0040);
    }

    #[test]
    fn engine_and_entry() {
        let cli = Cli::parse_from(["r4300-mu", "--engine", "recompiler", "--entry", "80001000"]);
        assert_eq!(cli.global.engine, EngineKind::Recompiler);
        assert_eq!(cli.global.entry, 0x8000_1000);
    }
}
