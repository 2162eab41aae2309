use std::{io, io::Write};

use colored::Colorize;

pub fn print_error_message(error_message: &str) {
    println!("{}", error_message.red());
}

pub fn print_warn_message(warn_message: &str) {
    println!("{}", warn_message.yellow());
}

pub fn print_success_message(success_message: &str) {
    println!("{}", success_message.green());
}

/// Asks a yes/no question, anything but `yes` is a no.
pub fn prompt_for_confirmation(question: &str) -> io::Result<bool> {
    print!("{} [{}]: ", question.yellow(), "yes/no".green());
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("yes"))
}
