// Output module for nexus-play

pub mod errors;
pub mod json_output;
pub mod terminal;

pub use errors::*;
pub use json_output::*;
pub use terminal::*;

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text output with colors
    #[default]
    Text,
    /// Machine-readable JSON output (NDJSON format)
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}' (expected text or json)", other)),
        }
    }
}

/// Unified output writer supporting both text and JSON formats
pub enum OutputWriter {
    Text(TerminalOutput),
    Json(JsonOutput),
}

impl OutputWriter {
    pub fn new(format: OutputFormat, verbose: bool, quiet: bool) -> Self {
        match format {
            OutputFormat::Text => OutputWriter::Text(TerminalOutput::new(verbose, quiet)),
            OutputFormat::Json => OutputWriter::Json(JsonOutput::new(verbose, quiet)),
        }
    }

    pub fn print_play_header(&self, play: &str, hosts_count: usize) {
        match self {
            OutputWriter::Text(output) => output.print_play_header(play, hosts_count),
            OutputWriter::Json(output) => output.print_play_header(play, hosts_count),
        }
    }

    pub fn print_host_header(&self, host: &str) {
        match self {
            OutputWriter::Text(output) => output.print_host_header(host),
            OutputWriter::Json(output) => output.print_host_header(host),
        }
    }

    pub fn print_task(&self, step: &TaskStep) {
        match self {
            OutputWriter::Text(output) => output.print_task(step),
            OutputWriter::Json(output) => output.print_task(step),
        }
    }

    pub fn print_recap(&self, recap: &PlayRecap) {
        match self {
            OutputWriter::Text(output) => output.print_recap(recap),
            OutputWriter::Json(output) => output.print_recap(recap),
        }
    }
}
