// Command-line flags. Anything given here overrides config.toml.

use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, Default, Clone, PartialEq, Eq)]
#[command(name = "frame-ring")]
#[command(
    version,
    about = "Frame-pipelined swap chain renderer",
    long_about = "Clears a window every frame with N frames in flight, \
                  synchronizing CPU and GPU through one monotonic fence.\n\n\
                  Keys: V toggles v-sync, F11 or Alt+Enter toggles fullscreen, Escape quits."
)]
// -h is the window height, help stays on --help
#[command(disable_help_flag = true)]
pub struct Args {
    /// Window width in pixels
    #[arg(short = 'w', long)]
    pub width: Option<u32>,

    /// Window height in pixels
    #[arg(short = 'h', long)]
    pub height: Option<u32>,

    /// Use the software (WARP-style) adapter
    #[arg(long)]
    pub warp: bool,

    /// Present without waiting for vertical blank
    #[arg(long)]
    pub no_vsync: bool,

    /// Configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Render this many frames on the software GPU timeline and exit
    #[arg(long, value_name = "FRAMES")]
    pub headless: Option<u64>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_h_is_height() {
        let args = Args::try_parse_from(["frame-ring", "-w", "800", "-h", "600"]).unwrap();
        assert_eq!(args.width, Some(800));
        assert_eq!(args.height, Some(600));
    }

    #[test]
    fn flags_parse() {
        let args =
            Args::try_parse_from(["frame-ring", "--warp", "--no-vsync", "--headless", "120"]).unwrap();
        assert!(args.warp);
        assert!(args.no_vsync);
        assert_eq!(args.headless, Some(120));
        assert_eq!(args.config, None);
    }

    #[test]
    fn long_help_is_still_available() {
        let err = Args::try_parse_from(["frame-ring", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn rejects_non_numeric_sizes() {
        assert!(Args::try_parse_from(["frame-ring", "--width", "wide"]).is_err());
    }
}
