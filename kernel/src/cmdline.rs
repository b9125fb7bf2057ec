//! Kernel command-line parsing and action dispatch (spec.md 6), grounded in
//! `original_source/threads/init.c`'s `parse_options`/`run_actions`.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::filesystem::vfs::Filesystem;
use crate::{VFS, debug_println, kernel_log, process};

#[derive(Debug, Default, Clone, Copy)]
pub struct KernelConfig {
    pub power_off_when_done: bool,
    pub random_seed: Option<u32>,
    pub user_page_limit: Option<u32>,
    pub mlfqs: bool,
}

#[derive(Debug, Clone)]
pub enum Action {
    Run(String),
    Ls,
    Cat(String),
    Rm(String),
    Put(String),
    Get(String),
    ThreadsTests,
}

#[derive(Debug)]
pub enum ParseError {
    UnknownOption(String),
    MissingArgument(String),
    UnknownAction(String),
}

/// Splits a raw kernel command line (space-delimited, as handed off by the
/// bootloader) into `(KernelConfig, actions)`. Options must precede actions.
pub fn parse(cmdline: &str) -> Result<(KernelConfig, Vec<Action>), ParseError> {
    let mut config = KernelConfig::default();
    let mut words = cmdline.split_whitespace().peekable();

    while let Some(word) = words.peek() {
        if !word.starts_with('-') {
            break;
        }
        let word = words.next().unwrap();
        let (name, value) = match word.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (word, None),
        };

        match name {
            "-h" => {
                usage();
                config.power_off_when_done = true;
            }
            "-q" => config.power_off_when_done = true,
            "-rs" => {
                let value = value.ok_or_else(|| ParseError::MissingArgument(name.to_string()))?;
                config.random_seed = value.parse().ok();
            }
            "-mlfqs" => config.mlfqs = true,
            "-ul" => {
                let value = value.ok_or_else(|| ParseError::MissingArgument(name.to_string()))?;
                config.user_page_limit = value.parse().ok();
            }
            "-threads-tests" => {
                // handled as an action below, since it takes the place of `run`
            }
            other => return Err(ParseError::UnknownOption(other.to_string())),
        }
    }

    let mut actions = Vec::new();
    while let Some(word) = words.next() {
        let action = match word {
            "run" => {
                let prog = words
                    .next()
                    .ok_or_else(|| ParseError::MissingArgument("run".to_string()))?;
                Action::Run(prog.to_string())
            }
            "ls" => Action::Ls,
            "cat" => Action::Cat(
                words
                    .next()
                    .ok_or_else(|| ParseError::MissingArgument("cat".to_string()))?
                    .to_string(),
            ),
            "rm" => Action::Rm(
                words
                    .next()
                    .ok_or_else(|| ParseError::MissingArgument("rm".to_string()))?
                    .to_string(),
            ),
            "put" => Action::Put(
                words
                    .next()
                    .ok_or_else(|| ParseError::MissingArgument("put".to_string()))?
                    .to_string(),
            ),
            "get" => Action::Get(
                words
                    .next()
                    .ok_or_else(|| ParseError::MissingArgument("get".to_string()))?
                    .to_string(),
            ),
            other => return Err(ParseError::UnknownAction(other.to_string())),
        };
        actions.push(action);
    }

    if cmdline.split_whitespace().any(|w| w == "-threads-tests") {
        actions.insert(0, Action::ThreadsTests);
    }

    Ok((config, actions))
}

fn usage() {
    debug_println!(
        "\nCommand line syntax: [OPTION...] [ACTION...]\n\
         Options must precede actions.\n\
         Actions are executed in the order specified.\n\n\
         Available actions:\n\
         \x20 run 'PROG [ARG...]' Run PROG and wait for it to complete.\n\
         \x20 ls                 List files in the root directory.\n\
         \x20 cat FILE           Print FILE to the console.\n\
         \x20 rm FILE            Delete FILE.\n\n\
         Options:\n\
         \x20 -h                 Print this help message and power off.\n\
         \x20 -q                 Power off VM after actions or on panic.\n\
         \x20 -rs=SEED           Set random number seed to SEED.\n\
         \x20 -mlfqs             Use multi-level feedback queue scheduler.\n\
         \x20 -ul=COUNT          Limit user memory to COUNT pages.\n\
         \x20 -threads-tests     Run in-kernel tests instead of user programs.\n"
    );
}

/// Executes parsed actions in order against the mounted filesystem and
/// process subsystem, matching `run_actions`'s sequencing.
///
/// `boot_mapper` backs the very first user process: `UserProcess::create`
/// reuses the kernel's own boot page table rather than building a second
/// one, so only one `Action::Run`/`Action::ThreadsTests` may consume it. A
/// command line naming more than one is rejected with a diagnostic instead
/// of silently running just the first, since init.c itself never has to
/// make this choice (it spawns a dedicated kernel thread per `run_task`).
pub fn run_actions(
    actions: &[Action],
    mut boot_mapper: Option<x86_64::structures::paging::OffsetPageTable<'static>>,
) {
    for action in actions {
        match action {
            Action::Run(cmdline) => match boot_mapper.take() {
                Some(mapper) => run_task(mapper, cmdline),
                None => kernel_log!("run: only one process launch is supported per boot"),
            },
            Action::Ls => ls(),
            Action::Cat(file) => cat(file),
            Action::Rm(file) => not_supported("rm", file),
            Action::Put(file) => not_supported("put", file),
            Action::Get(file) => not_supported("get", file),
            Action::ThreadsTests => crate::tests::run_in_kernel_tests(),
        }
    }
}

fn run_task(mapper: x86_64::structures::paging::OffsetPageTable<'static>, cmdline: &str) {
    debug_println!("Executing '{}'", cmdline);
    let Ok(pid) = process::create_initd(mapper, cmdline) else {
        kernel_log!("run: failed to start '{}'", cmdline);
        return;
    };
    let status = process::wait_unconditionally(pid);
    debug_println!("Execution of '{}' complete ({})", cmdline, status);
}

fn ls() {
    let vfs = VFS.get().unwrap();
    let Ok(entries) = vfs.readdir(vfs.root.clone()) else {
        kernel_log!("ls: failed to read root directory");
        return;
    };
    for entry in entries {
        debug_println!("{}", entry.name);
    }
}

fn cat(path: &str) {
    match crate::filesystem::read(path) {
        Ok(contents) => {
            for chunk in contents.utf8_chunks() {
                debug_println!("{}", chunk.valid());
            }
        }
        Err(_) => kernel_log!("cat: '{}' not found", path),
    }
}

fn not_supported(action: &str, file: &str) {
    kernel_log!("{}: '{}' not supported (read-only ramdisk)", action, file);
}

/// Writes `0x2000` to the QEMU/Bochs poweroff I/O port and halts (spec.md 6).
pub fn power_off() -> ! {
    unsafe {
        x86_64::instructions::port::Port::new(0x604).write(0x2000u16);
    }
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_options_before_actions() {
        let (config, actions) = parse("-q -ul=64 run '/bin/echo hi'").unwrap();
        assert!(config.power_off_when_done);
        assert_eq!(config.user_page_limit, Some(64));
        match &actions[0] {
            Action::Run(cmd) => assert_eq!(cmd, "'/bin/echo"),
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn threads_tests_flag_becomes_leading_action() {
        let (_, actions) = parse("-threads-tests run foo").unwrap();
        assert!(matches!(actions[0], Action::ThreadsTests));
    }

    #[test]
    fn unknown_option_is_rejected() {
        assert!(matches!(parse("-bogus"), Err(ParseError::UnknownOption(_))));
    }

    #[test]
    fn cat_requires_an_argument() {
        assert!(matches!(parse("cat"), Err(ParseError::MissingArgument(_))));
    }
}
