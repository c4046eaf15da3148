use std::path::PathBuf;

use argparse::{ArgumentParser, Print, Store};

const DEFAULT_CONFIG_PATH: &str = "/etc/dgpu/config.json";

pub struct ArgsOptions {
    pub config_file_path: PathBuf,
}

impl ArgsOptions {
    pub fn parse() -> Self {
        let mut config_file_path = DEFAULT_CONFIG_PATH.to_string();

        {
            let mut parser = ArgumentParser::new();

            parser.set_description(
                "Discrete GPU power switching daemon for Optimus laptops",
            );

            // Configuration file path
            parser.refer(&mut config_file_path).add_option(
                &["-c", "--config"],
                Store,
                "The file path of the configuration file",
            );

            // Show daemon version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the daemon version",
            );

            parser.parse_args_or_exit();
        }

        Self {
            config_file_path: PathBuf::from(config_file_path),
        }
    }
}
