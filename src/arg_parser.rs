use argparse::{ArgumentParser, Print, Store};

pub struct ArgsOptions {
    pub command: String,
}

impl ArgsOptions {
    pub fn parse() -> Self {
        let mut options = ArgsOptions::default();

        {
            let mut parser = ArgumentParser::new();

            parser.set_description(
                "Control the discrete GPU power switch daemon",
            );

            // Command to send to the daemon
            parser.refer(&mut options.command).add_argument(
                "command",
                Store,
                "One of: status, on, off (default: status)",
            );

            // Show client version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the client version",
            );

            parser.parse_args_or_exit();
        }

        options
    }
}

impl Default for ArgsOptions {
    fn default() -> Self {
        Self {
            command: "status".to_string(),
        }
    }
}
