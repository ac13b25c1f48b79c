use std::process::ExitCode;

fn main() -> ExitCode {
    mesa_cli::run()
}
