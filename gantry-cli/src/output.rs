// Terminal Output
// Colored stderr helpers shared by the gantry subcommands

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const FAINT: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const CYAN: &str = "\x1b[36m";

const TICK: char = '\u{2713}';
const CROSS: char = '\u{2717}';

fn paint(style: &str, text: &str) -> String {
    format!("{}{}{}", style, text, RESET)
}

/// Right-aligned verb, cargo style: "     Loading ci.yml"
pub fn status(action: &str, message: &str) {
    eprintln!("{} {}", paint(&format!("{BOLD}{CYAN}"), &format!("{:>12}", action)), message);
}

pub fn header(message: &str) {
    eprintln!("{}", paint(BOLD, &format!("==> {}", message)));
}

pub fn success(message: &str) {
    eprintln!("  {} {}", paint(&format!("{BOLD}{GREEN}"), &TICK.to_string()), message);
}

pub fn failure(message: &str) {
    eprintln!("  {} {}", paint(&format!("{BOLD}{RED}"), &CROSS.to_string()), message);
}

pub fn check(message: &str) {
    eprintln!("  {} {}", paint(GREEN, &TICK.to_string()), message);
}

pub fn info(message: &str) {
    eprintln!("  {} {}", paint(CYAN, "i"), message);
}

pub fn warning(message: &str) {
    eprintln!("  {} {}", paint(YELLOW, "!"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", paint(&format!("{BOLD}{RED}"), "error:"), message);
}

pub fn dim(message: &str) {
    eprintln!("{}", paint(FAINT, message));
}

pub fn dim_success(message: &str) {
    eprintln!("{}", paint(GREEN, message));
}

pub fn dim_failure(message: &str) {
    eprintln!("{}", paint(RED, message));
}

/// Cells interleave, so every line below carries the cell label
pub fn cell_header(cell: &str, total_steps: usize) {
    eprintln!("  {} {} ({} steps)", paint(&format!("{BOLD}{BLUE}"), "Cell"), cell, total_steps);
}

/// Step stdout goes to stdout, uncolored, so it can be piped
pub fn step_output(cell: &str, line: &str) {
    println!("    [{}] | {}", cell, line);
}

pub fn step_error(cell: &str, line: &str) {
    eprintln!("{}", paint(RED, &format!("    [{}] | {}", cell, line)));
}
