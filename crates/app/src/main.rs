use std::process::ExitCode;

fn main() -> ExitCode {
    match vidsr_app::run_from_env() {
        Ok(outcome) => outcome.exit_code(),
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}
