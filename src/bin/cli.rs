//! Wish Agent - propose, confirm and execute wishes
//!
//! This is the CLI entry point for the wish-agent tool.
//! Run with: cargo run --bin wish-agent

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing_subscriber::EnvFilter;
use wish_agent::otp::CodeSource;
use wish_agent::vault::AuthOptions;
use wish_agent::{EngineSettings, InboundMessage, Secrets, Task, TaskOrchestrator, TaskStatus};

type Input = Lines<BufReader<Stdin>>;

const HELP: &str = "\
Commands:
  <wish>                          submit a wish and get a proposal
  :confirm <task>                 confirm a proposal and start it
  :login <task>                   enter credentials for a suspended task
  :otp <sms|email> <sender> <msg> forward a message carrying a one-time code
  :tasks                          list your tasks
  :status <task>                  show execution progress
  :revise <task> <text>           revise a wish
  :cancel <task>                  cancel a task
  quit                            exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = EngineSettings::load();
    let owner = settings.default_owner.clone();
    let orchestrator = Arc::new(settings.build_orchestrator()?);

    println!("🤖 Wish Agent");
    println!("================================================");
    println!("Model: {} @ {}", settings.model_name, settings.base_url);
    println!("Search: {}", if settings.search_api_key.is_empty() { "disabled" } else { "enabled" });
    println!("WebDriver: {}", settings.webdriver_url);
    println!("Owner: {}", owner);
    println!("================================================\n");

    // A wish passed as arguments is proposed once, then the loop starts
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    if !args.is_empty() {
        let wish = args.join(" ");
        submit(&orchestrator, &mut input, &owner, &wish).await?;
    }

    println!("{}\n", HELP);
    loop {
        let Some(line) = prompt(&mut input, "📝 Wish: ").await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            println!("Goodbye! 👋");
            break;
        }

        if let Err(e) = dispatch(&orchestrator, &mut input, &owner, line).await {
            eprintln!("\n❌ Error: {}\n", e);
        }
    }

    Ok(())
}

async fn dispatch(
    orchestrator: &Arc<TaskOrchestrator>,
    input: &mut Input,
    owner: &str,
    line: &str,
) -> anyhow::Result<()> {
    let Some(command) = line.strip_prefix(':') else {
        return submit(orchestrator, input, owner, line).await;
    };

    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    match name {
        "help" => println!("{}", HELP),
        "tasks" => {
            let tasks = orchestrator.list_tasks(Some(owner), 20).await;
            if tasks.is_empty() {
                println!("No tasks yet.");
            }
            for task in tasks {
                println!("{}  {:<21} {}", task.id, task.status.as_str(), task.current_wish);
            }
        }
        "status" => {
            let task_id = required(rest, "task id")?;
            match orchestrator.execution_status(task_id).await? {
                Some(state) => {
                    println!("Status: {}", state.status);
                    if let Some(step) = state.current_step {
                        println!("Current step: {}", step);
                    }
                    let done: Vec<&str> = state.steps_completed.iter().map(|s| s.as_str()).collect();
                    println!("Completed: {}", done.join(", "));
                    if let Some(error) = state.error_message {
                        println!("Error: {}", error);
                    }
                    if let Some(screenshot) = state.screenshot_ref {
                        println!("Screenshot: {}", screenshot);
                    }
                }
                None => println!("No execution recorded for {}", task_id),
            }
        }
        "confirm" => {
            let task_id = required(rest, "task id")?.to_string();
            start_confirm(orchestrator, task_id);
        }
        "login" => {
            let task_id = required(rest, "task id")?;
            login(orchestrator, input, task_id).await?;
        }
        "otp" => {
            let mut parts = rest.splitn(3, ' ');
            let (Some(source), Some(sender), Some(body)) = (parts.next(), parts.next(), parts.next()) else {
                anyhow::bail!("usage: :otp <sms|email> <sender> <message>");
            };
            let source = match source {
                "sms" => CodeSource::Sms,
                "email" => CodeSource::Email,
                other => anyhow::bail!("unknown source: {}", other),
            };
            orchestrator
                .pool()
                .context()
                .otp
                .ingest(InboundMessage::new(owner, source, sender, body))
                .await;
            println!("📨 Message forwarded.");
        }
        "revise" => {
            let (task_id, text) = rest.split_once(' ').unwrap_or((rest, ""));
            let text = required(text.trim(), "revision text")?;
            let task = orchestrator.revise(required(task_id, "task id")?, text).await?;
            propose_and_ask(orchestrator, input, task).await?;
        }
        "cancel" => {
            let task = orchestrator.cancel(required(rest, "task id")?).await?;
            if task.status != TaskStatus::Cancelled {
                println!("🛑 Cancellation requested, the run stops at its next step.");
            } else {
                println!("🛑 Task {} is {}", task.id, task.status);
            }
        }
        other => println!("Unknown command :{}. Type :help for commands.", other),
    }
    Ok(())
}

async fn submit(
    orchestrator: &Arc<TaskOrchestrator>,
    input: &mut Input,
    owner: &str,
    wish: &str,
) -> anyhow::Result<()> {
    let task = orchestrator.submit_wish(wish, owner).await?;
    propose_and_ask(orchestrator, input, task).await
}

async fn propose_and_ask(
    orchestrator: &Arc<TaskOrchestrator>,
    input: &mut Input,
    task: Task,
) -> anyhow::Result<()> {
    println!("\n📋 Task {} ({})", task.id, task.classified_type);
    for (i, candidate) in task.search_results.iter().take(5).enumerate() {
        println!("  [{}] {}", i, candidate.title);
    }
    println!("\n{}\n", task.proposal_text);

    let answer = prompt(input, "Confirm? [y/N]: ").await?.unwrap_or_default();
    if matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
        start_confirm(orchestrator, task.id);
    } else {
        println!("Not confirmed. Use :confirm {} or :revise {} <text>.", task.id, task.id);
    }
    Ok(())
}

/// Run the confirmation in the background so `:otp` and `:cancel` stay
/// available while it executes.
fn start_confirm(orchestrator: &Arc<TaskOrchestrator>, task_id: String) {
    println!("🚀 Executing {} ...", task_id);
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        match orchestrator.confirm(&task_id).await {
            Ok(task) => report(&task),
            Err(e) => eprintln!("\n❌ {}: {}", task_id, e),
        }
    });
}

async fn login(orchestrator: &Arc<TaskOrchestrator>, input: &mut Input, task_id: &str) -> anyhow::Result<()> {
    let task = orchestrator
        .get_task(task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task not found: {}", task_id))?;
    let Some(service) = task
        .execution
        .as_ref()
        .and_then(|e| e.result.awaiting_service.clone())
    else {
        anyhow::bail!("task {} is not waiting for credentials", task_id);
    };

    let options = AuthOptions::for_service(&service);
    println!("🔑 Sign in to {}", options.display_name);
    let mut secrets = Secrets::new();
    for field in &options.login_fields {
        let value = prompt(input, &format!("{}: ", field.label)).await?.unwrap_or_default();
        secrets.insert(field.name.clone(), value.trim());
    }
    let save = prompt(input, "Save these credentials? [y/N]: ")
        .await?
        .is_some_and(|a| matches!(a.trim().to_lowercase().as_str(), "y" | "yes"));

    let task = orchestrator
        .provide_credentials(task_id, &service, secrets, save)
        .await?;
    report(&task);
    Ok(())
}

fn report(task: &Task) {
    let Some(execution) = &task.execution else {
        println!("\nTask {} is {}", task.id, task.status);
        return;
    };
    let result = &execution.result;
    match task.status {
        TaskStatus::Completed => {
            println!("\n✅ {}", result.message);
            if let Some(id) = &result.confirmation_id {
                println!("   Reference: {}", id);
            }
        }
        TaskStatus::AwaitingCredentials => {
            println!("\n🔑 {}", result.message);
            println!("   Use :login {} to continue.", task.id);
        }
        _ => println!("\n⚠️ Task {} is {}: {}", task.id, task.status, result.message),
    }
}

fn required<'a>(value: &'a str, what: &str) -> anyhow::Result<&'a str> {
    if value.is_empty() {
        anyhow::bail!("missing {}", what);
    }
    Ok(value)
}

async fn prompt(input: &mut Input, label: &str) -> anyhow::Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(label.as_bytes()).await?;
    stdout.flush().await?;
    Ok(input.next_line().await?)
}
