//! Command-line handling for the engine binary

use std::fmt;

/// What the binary should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Run every background job on its interval until ctrl-c
    #[default]
    Scheduler,
    /// Rebuild the similarity index once and exit
    SimilarityRebuild,
    /// Run one clustering pass and exit
    Clustering,
}

impl RunMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduler" => Some(RunMode::Scheduler),
            "similarity-rebuild" => Some(RunMode::SimilarityRebuild),
            "clustering" => Some(RunMode::Clustering),
            _ => None,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Scheduler => "scheduler",
            RunMode::SimilarityRebuild => "similarity-rebuild",
            RunMode::Clustering => "clustering",
        })
    }
}

/// Read `--mode <mode>` or `--mode=<mode>`; other arguments are ignored
pub fn parse_mode<I: IntoIterator<Item = String>>(args: I) -> Result<RunMode, String> {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let value = if arg == "--mode" {
            args.next().ok_or_else(|| "--mode requires a value".to_string())?
        } else if let Some(value) = arg.strip_prefix("--mode=") {
            value.to_string()
        } else {
            continue;
        };
        return RunMode::parse(&value).ok_or_else(|| {
            format!("unknown mode '{}', expected scheduler, similarity-rebuild or clustering", value)
        });
    }
    Ok(RunMode::default())
}
