//! The otto-bgp binary.

use std::env::current_dir;
use std::process::exit;
use clap::{App, crate_authors, crate_version};
use log::error;
use otto_bgp::{Config, ExitError, Operation};
use otto_bgp::process::Process;

// Since `main` with a result insists on printing a message, but in our
// case all diagnostics have been logged by the time we get an error, we
// make our own, more quiet version.
fn _main() -> Result<(), ExitError> {
    Process::init()?;
    let cur_dir = match current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            error!(
                "Fatal: cannot get current directory ({}). Aborting.",
                err
            );
            return Err(ExitError::Generic)
        }
    };
    let matches = Operation::config_args(Config::config_args(
        App::new("otto-bgp")
            .version(crate_version!())
            .author(crate_authors!())
            .about("automates BGP prefix-list policy management")
    )).get_matches();
    let config = Config::from_arg_matches(&matches, &cur_dir)?;
    let operation = Operation::from_arg_matches(&matches, &cur_dir)?;
    operation.run(config)
}

fn main() {
    match _main() {
        Ok(_) => exit(0),
        Err(err) => exit(err.exit_code()),
    }
}
