//! Integration tests: dispatcher and executor against real `sh` processes.

#![cfg(unix)]

mod common;

use common::{authorization_table, eventually, message, table};
use rcebot::channels::{Reply, ReplyFormat};
use rcebot::dispatch::Dispatcher;
use rcebot::exec::Executor;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn dispatcher(json: &str) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(table(json), Executor::new(), "rcebot"))
}

#[tokio::test]
async fn second_exec_is_rejected_while_first_runs() {
    let d = dispatcher(
        r#"{"users":[{"id":1,"commands":[{"name":"sh","args":["-c","sleep 0.5; echo done"]}]}]}"#,
    );
    let first = tokio::spawn({
        let d = d.clone();
        async move { d.dispatch(&message(1, "/exec 0")).await }
    });
    let table = d.table().clone();
    eventually(|| table.load().commands(1)[0].slot().is_running()).await;

    let busy = d.dispatch(&message(1, "/exec 0")).await.unwrap();
    assert_eq!(
        busy,
        Reply::markdown("The command is already running\\. Use `/cancel 0` to cancel it\\.")
    );

    let done = first.await.unwrap().unwrap();
    assert_eq!(done.text, "```\ndone\n```\n");
    assert!(!table.load().commands(1)[0].slot().is_running());

    let again = d.dispatch(&message(1, "/exec 0")).await.unwrap();
    assert_eq!(again.text, "```\ndone\n```\n");
}

#[tokio::test]
async fn cancel_escalates_to_kill_when_interrupt_is_ignored() {
    let d = dispatcher(
        r#"{"users":[{"id":1,"commands":[
            {"name":"sh","args":["-c","trap '' INT; echo started; exec sleep 30"],"execTimeout":"30s","exitTimeout":"200ms"}
        ]}]}"#,
    );
    let running = tokio::spawn({
        let d = d.clone();
        async move { d.dispatch(&message(1, "/exec 0")).await }
    });
    let table = d.table().clone();
    eventually(|| table.load().commands(1)[0].slot().is_running()).await;
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let canceled_at = Instant::now();
    let canceled = d.dispatch(&message(1, "/cancel 0")).await.unwrap();
    assert_eq!(canceled.format, ReplyFormat::Plain);
    assert_eq!(
        canceled.text,
        "The command has been canceled. You may need to wait up to 200ms for it to be killed."
    );

    let reply = running.await.unwrap().unwrap();
    let elapsed = canceled_at.elapsed();
    assert!(
        elapsed < Duration::from_millis(200) + Duration::from_millis(800),
        "killed {:?} after cancel",
        elapsed
    );
    assert!(reply.text.starts_with("```\nstarted\n```\n"), "{}", reply.text);
    assert!(
        reply.text.contains("process canceled, killed after exit timeout"),
        "{}",
        reply.text
    );

    let idle = d.dispatch(&message(1, "/cancel 0")).await.unwrap();
    assert_eq!(
        idle,
        Reply::markdown("The command is not running\\. Use `/exec 0` to execute it\\.")
    );
}

#[tokio::test]
async fn other_slots_run_while_one_is_busy() {
    let d = dispatcher(
        r#"{"users":[
            {"id":1,"commands":[{"name":"sh","args":["-c","sleep 2; echo slow"]},{"name":"echo","args":["fast"]}]},
            {"id":2,"commands":[{"name":"echo","args":["other"]}]}
        ]}"#,
    );
    let slow = tokio::spawn({
        let d = d.clone();
        async move { d.dispatch(&message(1, "/exec 0")).await }
    });
    let table = d.table().clone();
    eventually(|| table.load().commands(1)[0].slot().is_running()).await;

    let started = Instant::now();
    let same_sender = d.dispatch(&message(1, "/exec 1")).await.unwrap();
    let other_sender = d.dispatch(&message(2, "/exec 0")).await.unwrap();
    assert_eq!(same_sender.text, "```\nfast\n```\n");
    assert_eq!(other_sender.text, "```\nother\n```\n");
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert!(table.load().commands(1)[0].slot().is_running());

    let reply = slow.await.unwrap().unwrap();
    assert_eq!(reply.text, "```\nslow\n```\n");
}

#[tokio::test]
async fn exec_timeout_interrupts_the_process() {
    let d = dispatcher(
        r#"{"users":[{"id":1,"commands":[{"name":"sleep","args":["30"],"execTimeout":"100ms","exitTimeout":"2s"}]}]}"#,
    );
    let reply = d.dispatch(&message(1, "/exec 0")).await.unwrap();
    assert!(reply.text.starts_with("```\n\n```\n"), "{}", reply.text);
    assert!(reply.text.contains("exec timeout"), "{}", reply.text);
    assert!(!reply.text.contains("killed after"), "{}", reply.text);
}

#[tokio::test]
async fn reload_revokes_access_without_disturbing_running_command() {
    let d = dispatcher(
        r#"{"users":[{"id":1,"commands":[{"name":"sh","args":["-c","sleep 0.3; echo still here"]}]}]}"#,
    );
    let running = tokio::spawn({
        let d = d.clone();
        async move { d.dispatch(&message(1, "/exec 0")).await }
    });
    let handle = d.table().clone();
    let old = handle.load();
    eventually(|| old.commands(1)[0].slot().is_running()).await;

    handle.publish(authorization_table(
        r#"{"users":[{"id":2,"commands":[{"name":"true"}]}]}"#,
    ));

    let denied = d.dispatch(&message(1, "/list")).await.unwrap();
    assert_eq!(
        denied,
        Reply::plain("You are not authorized to execute any commands.")
    );
    let listed = d.dispatch(&message(2, "/list")).await.unwrap();
    assert_eq!(listed.text, "\\[0\\] `true`\n");

    let reply = running.await.unwrap().unwrap();
    assert_eq!(reply.text, "```\nstill here\n```\n");
}

#[tokio::test]
async fn shutdown_interrupts_running_and_refuses_new_work() {
    let d = dispatcher(
        r#"{"users":[{"id":1,"commands":[{"name":"sleep","args":["30"]},{"name":"true"}]}]}"#,
    );
    let running = tokio::spawn({
        let d = d.clone();
        async move { d.dispatch(&message(1, "/exec 0")).await }
    });
    let table = d.table().clone();
    eventually(|| table.load().commands(1)[0].slot().is_running()).await;

    d.executor().shutdown();
    let reply = running.await.unwrap().unwrap();
    assert!(reply.text.contains("process canceled"), "{}", reply.text);

    let refused = d.dispatch(&message(1, "/exec 1")).await.unwrap();
    assert_eq!(
        refused,
        Reply::plain("The bot is shutting down. Try again later.")
    );
}
