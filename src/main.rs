use std::process::ExitCode;

fn main() -> ExitCode {
    match covenant::run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("covenant: {}", err);
            ExitCode::from(2)
        }
    }
}
