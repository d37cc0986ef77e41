use std::env;
use std::process::ExitCode;
use log::error;
use embre_agent::run;
use embre_agent::error::AppRunError;

fn main() -> ExitCode {
    let args = env::args();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ AppRunError::ValidationError { .. }) => {
            eprintln!("{}", err);
            ExitCode::from(2)
        },
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        },
    }
}
