// Output formatting helpers for CLI commands
// Status lines go to stderr; job output goes to stdout so it can be piped

const BOLD_CYAN: &str = "1;36";
const BOLD_GREEN: &str = "1;32";
const BOLD_RED: &str = "1;31";
const GREEN: &str = "32";
const RED: &str = "31";
const YELLOW: &str = "33";
const CYAN: &str = "36";
const DIM: &str = "2";

fn paint(code: &str, text: &str) -> String {
    format!("\x1b[{}m{}\x1b[0m", code, text)
}

/// Right-aligned action label followed by a message
pub fn status(action: &str, message: &str) {
    eprintln!("{} {}", paint(BOLD_CYAN, &format!("{:>12}", action)), message);
}

pub fn success(message: &str) {
    eprintln!("{} {}", paint(BOLD_GREEN, "  \u{2713}"), message);
}

pub fn failure(message: &str) {
    eprintln!("{} {}", paint(BOLD_RED, "  \u{2717}"), message);
}

/// Passed validation step
pub fn check(message: &str) {
    eprintln!("{} {}", paint(GREEN, "  \u{2713}"), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", paint(YELLOW, "  !"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", paint(BOLD_RED, "error:"), message);
}

pub fn info(message: &str) {
    eprintln!("{} {}", paint(CYAN, "  i"), message);
}

pub fn dim(message: &str) {
    eprintln!("{}", paint(DIM, message));
}

/// Job or stage result line, green when it passed and red otherwise
pub fn result(message: &str, passed: bool) {
    eprintln!("{}", paint(if passed { GREEN } else { RED }, message));
}

pub fn stage_header(name: &str, total_jobs: usize) {
    eprintln!("{} '{}' ({} jobs)", paint("1;34", "  Stage"), name, total_jobs);
}

/// One line of job output; stderr lines are shown in red
pub fn job_output(line: &str, is_error: bool) {
    if is_error {
        eprintln!("{}", paint(RED, &format!("      | {}", line)));
    } else {
        println!("      | {}", line);
    }
}

pub fn header(message: &str) {
    eprintln!("{}", paint("1", &format!("==> {}", message)));
}
