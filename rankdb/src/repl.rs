//! Thin interactive front-end: prompt, read, parse.
//!
//! Input maps onto the closed [`Command`] set; anything unparseable
//! reprints the instruction banner and asks again.

use rankdb_protocol::Command;
use std::io::{self, BufRead, Write};

pub fn print_instructions() {
    println!("commands:");
    println!("  s | step             execute one machine instruction");
    println!("  c | continue         run until the next breakpoint or exit");
    println!("  b | break <line>     insert a breakpoint at a source line");
    println!("  bt | stack           print the call stack");
    println!("  regs                 print the registers");
    println!("  p | print <var>      print a variable's value");
    println!("  q | quit             terminate the target and exit");
}

/// Block until the user enters a valid command. Returns `Quit` on EOF.
pub fn ask_for_input() -> Command {
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return Command::Quit,
            Ok(_) => {}
            Err(_) => return Command::Quit,
        }

        match parse(line.trim()) {
            Some(command) => return command,
            None => {
                println!("unrecognized command: {}", line.trim());
                print_instructions();
            }
        }
    }
}

fn parse(line: &str) -> Option<Command> {
    let mut tokens = line.split_whitespace();
    let command = match tokens.next()? {
        "s" | "step" => Command::Step,
        "c" | "continue" | "cont" => Command::Continue,
        "b" | "break" => Command::Break {
            line: tokens.next()?.parse().ok()?,
        },
        "bt" | "stack" => Command::Stack,
        "regs" | "registers" => Command::Registers,
        "p" | "print" => Command::Print {
            variable: tokens.next()?.to_string(),
        },
        "q" | "quit" | "exit" => Command::Quit,
        "h" | "help" => Command::Help,
        _ => return None,
    };
    // Trailing garbage invalidates the command.
    if tokens.next().is_some() {
        return None;
    }
    Some(command)
}
