use std::process::ExitCode;

fn main() -> ExitCode {
    exportdesk_cli::run()
}
