use std::process::ExitCode;

fn main() -> ExitCode {
    score_feedback_cli::run()
}
