//! Dialogs answered on the terminal.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use workshop::WorkshopError;
use workshop::WorkshopResult;
use workshop::prompt::Prompter;

pub struct TerminalPrompter;

/// Print `question` and read one line. `None` on end of input.
async fn ask(question: String) -> WorkshopResult<Option<String>> {
    tokio::task::spawn_blocking(move || -> WorkshopResult<Option<String>> {
        let mut stdout = std::io::stdout();
        write!(stdout, "{} ", question)?;
        stdout.flush()?;

        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    })
    .await
    .map_err(|e| WorkshopError::Internal(format!("prompt task failed: {}", e)))?
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn select_directory(
        &self,
        message: &str,
        default: Option<&Path>,
    ) -> WorkshopResult<Option<PathBuf>> {
        let question = match default {
            Some(default) => format!("{} [{}]:", message, default.display()),
            None => format!("{}:", message),
        };
        let Some(answer) = ask(question).await? else {
            return Err(WorkshopError::Internal(
                "no terminal input to choose a directory".into(),
            ));
        };
        if answer.is_empty() {
            return Ok(default.map(Path::to_path_buf));
        }
        Ok(Some(PathBuf::from(answer)))
    }

    async fn confirm(&self, message: &str) -> WorkshopResult<bool> {
        let answer = ask(format!("{} [y/N]", message)).await?.unwrap_or_default();
        Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
    }

    async fn show_error(&self, title: &str, message: &str) {
        eprintln!("{}: {}", title, message);
    }
}
