use std::future::Future;
use std::io::Write;

use tokio::io::{stdin, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;

use automanager::utils::display_relative;
use automanager::validation::confirmation::TokenScope;
use automanager::{Assistant, Proposal, SubmitOutcome};

use super::render;

const HELP: &str = "\
Type a request in plain words, e.g. \"move all PDFs into Archive/2024\".

  :cd <dir>         change directory (starts a new conversation)
  :ls [dir]         list a directory
  :pwd              show the working directory
  :select [paths]   set the selection (empty clears it)
  :undo             undo the most recent plan
  :redo             redo the most recently undone plan
  :history          executed plans
  :reset            forget the conversation
  :holding          deleted items that can still be restored
  :purge            remove holding entries past their retention
  :status           check the model service
  :help             this text
  exit              quit

Ctrl-C cancels a request in progress.";

/// Runs `fut`, cancelling `cancel` on Ctrl-C and then waiting for `fut` to wind down
async fn interruptible<F: Future>(fut: F, cancel: &CancellationToken) -> F::Output {
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => out,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling...");
            cancel.cancel();
            fut.await
        }
    }
}

pub struct Repl {
    assistant: Assistant,
    auto_confirm: bool,
    input: Lines<BufReader<Stdin>>,
}

impl Repl {
    pub fn new(assistant: Assistant, auto_confirm: bool) -> Self {
        Self {
            assistant,
            auto_confirm,
            input: BufReader::new(stdin()).lines(),
        }
    }

    pub async fn run(&mut self) {
        println!("Type :help for commands.");
        loop {
            let cwd = self
                .assistant
                .working_directory()
                .map(|cwd| display_relative(&cwd, self.assistant.root()))
                .unwrap_or_default();
            print!("{}> ", cwd);
            let _ = std::io::stdout().flush();

            let line = match self.input.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    eprintln!("{}", e);
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if matches!(line, "exit" | "quit" | ":q") {
                break;
            }
            if let Some(command) = line.strip_prefix(':') {
                self.handle_command(command).await;
            } else {
                self.handle_request(line).await;
            }
        }
    }

    async fn ask(&mut self, question: &str) -> bool {
        print!("{} [y/N] ", question);
        let _ = std::io::stdout().flush();
        match self.input.next_line().await {
            Ok(Some(answer)) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }

    fn report(&self, err: &automanager::Error) {
        eprint!("{}", render::error(err, self.assistant.root()));
    }

    /// Interpret and, when approved, run one request. `false` when it did not complete.
    pub async fn handle_request(&mut self, request: &str) -> bool {
        let cancel = CancellationToken::new();
        let outcome = interruptible(self.assistant.submit(request, &cancel), &cancel).await;
        let proposal = match outcome {
            Ok(SubmitOutcome::Proposed(proposal)) => proposal,
            Ok(SubmitOutcome::Undone(summary)) => {
                println!("{}", render::undo(&summary));
                return true;
            }
            Ok(SubmitOutcome::Redone(summary)) => {
                println!("{}", render::redo(&summary));
                return true;
            }
            Err(e) => {
                self.report(&e);
                return false;
            }
        };

        print!("{}", render::proposal(&proposal, self.assistant.root()));
        if proposal.is_empty() {
            let _ = self.assistant.discard(proposal.plan.id);
            return true;
        }
        if proposal.needs_confirmation() && !self.confirm(&proposal).await {
            return false;
        }

        let cancel = CancellationToken::new();
        match interruptible(self.assistant.execute(proposal.plan.id, &cancel), &cancel).await {
            Ok(summary) => {
                println!("{}", render::execution(&summary));
                true
            }
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    async fn confirm(&mut self, proposal: &Proposal) -> bool {
        let plan_id = proposal.plan.id;
        let permanent = proposal
            .challenge
            .as_ref()
            .is_some_and(|c| c.requires_permanent);

        let approved = if self.auto_confirm && !permanent {
            true
        } else if permanent {
            self.ask("This cannot be undone. Delete permanently?").await
        } else {
            self.ask("Proceed?").await
        };
        if !approved {
            let _ = self.assistant.discard(plan_id);
            println!("Cancelled.");
            return false;
        }

        let scope = if permanent {
            TokenScope::Permanent
        } else {
            TokenScope::Standard
        };
        match self.assistant.confirm(plan_id, scope).await {
            Ok(confirmed) if !confirmed.needs_confirmation() => true,
            Ok(_) => {
                let _ = self.assistant.discard(plan_id);
                eprintln!("Plan {} still needs confirmation.", plan_id);
                false
            }
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    async fn handle_command(&mut self, command: &str) {
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        let root = self.assistant.root().to_path_buf();

        match name {
            "cd" => match self.assistant.change_directory(if arg.is_empty() { "." } else { arg }) {
                Ok(path) => println!("{}", path.display()),
                Err(e) => self.report(&e),
            },
            "pwd" => match self.assistant.working_directory() {
                Ok(path) => println!("{}", path.display()),
                Err(e) => self.report(&e),
            },
            "ls" => match self.assistant.list((!arg.is_empty()).then_some(arg)) {
                Ok(entries) => print!("{}", render::listing(&entries)),
                Err(e) => self.report(&e),
            },
            "select" => {
                let paths: Vec<String> = arg.split_whitespace().map(String::from).collect();
                match self.assistant.select(&paths) {
                    Ok(selected) if selected.is_empty() => println!("Selection cleared."),
                    Ok(selected) => {
                        for path in selected {
                            println!("  {}", display_relative(&path, &root));
                        }
                    }
                    Err(e) => self.report(&e),
                }
            }
            "undo" => match self.assistant.undo(None).await {
                Ok(summary) => println!("{}", render::undo(&summary)),
                Err(e) => self.report(&e),
            },
            "redo" => {
                let cancel = CancellationToken::new();
                match interruptible(self.assistant.redo(&cancel), &cancel).await {
                    Ok(summary) => println!("{}", render::redo(&summary)),
                    Err(e) => self.report(&e),
                }
            }
            "history" => match self.assistant.history() {
                Ok(plans) => print!("{}", render::history(&plans)),
                Err(e) => self.report(&e),
            },
            "reset" => match self.assistant.reset_session() {
                Ok(()) => println!("Conversation cleared."),
                Err(e) => self.report(&e),
            },
            "holding" => match self.assistant.holding_entries() {
                Ok(entries) => print!("{}", render::holding(&entries, &root)),
                Err(e) => self.report(&e),
            },
            "purge" => match self.assistant.purge_holding() {
                Ok(purged) => println!("Purged {} expired item(s).", purged.len()),
                Err(e) => self.report(&e),
            },
            "status" => match self.assistant.model_status().await {
                Ok(status) => print!("{}", render::model_status(&status)),
                Err(e) => self.report(&e),
            },
            "help" => println!("{}", HELP),
            other => eprintln!("Unknown command :{} (try :help)", other),
        }
    }
}
