use std::process::ExitCode;

fn main() -> ExitCode {
    match wiper_adapter::runtime::run_from_args() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wiper-adapter: {e}");
            ExitCode::FAILURE
        }
    }
}
