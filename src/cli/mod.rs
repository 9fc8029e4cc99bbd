// Command implementations behind the `netorch` binary
pub mod list;
pub mod run;
