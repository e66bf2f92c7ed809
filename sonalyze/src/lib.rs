// The machinery behind `sonalyze`: command line definitions, the analysis verbs and the table engine
// they print with, the remote bridge, and the daemon.

pub mod cache;
pub mod cli;
pub mod commands;
pub mod daemon;
pub mod dispatch;
pub mod ini;
pub mod remote;
pub mod table;
