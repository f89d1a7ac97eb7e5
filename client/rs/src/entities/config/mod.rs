/// Cli config + args.
pub mod cli;
/// Core (server) config.
pub mod core;
