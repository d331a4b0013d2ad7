// Runners Module
// Subprocess execution shared by steps, installers and command sinks

pub mod shell;

pub use shell::{OutputCallback, Script, Shell, ShellOutput, ShellRunner};
