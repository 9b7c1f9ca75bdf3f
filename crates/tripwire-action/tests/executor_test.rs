use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tripwire_action::{
  ActionExecutor, ChannelNotifier, ExecutionEvent, ExecutorConfig, InMemoryJournal, Journal,
  NoopJournal, TaskFailure, TaskRegistry, TaskRequest,
};
use tripwire_trigger::{Condition, Event, InstanceStatus, Position, Trigger};

fn trigger(chain: Value) -> Trigger {
  Trigger {
    trigger_id: "t1".to_string(),
    transient: false,
    condition: Condition::new("always"),
    action_chain: serde_json::from_value(chain).unwrap(),
    context: json!({"threshold": 10}),
  }
}

fn event(payload: Value) -> Event {
  Event {
    source: "orders".to_string(),
    key: Some("customer-1".to_string()),
    payload,
    position: Position::new("events", 0, 3),
  }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
  let mut events = vec![];
  while let Ok(event) = rx.try_recv() {
    events.push(event);
  }
  events
}

#[tokio::test]
async fn test_choice_takes_first_true_branch() {
  let executor = ActionExecutor::new(TaskRegistry::new(), ExecutorConfig::default());
  let chain = json!([{
    "type": "choice",
    "choices": [
      {"condition": "state.amount > 1000", "next": [{"type": "pass", "result": "huge"}]},
      {"condition": "state.amount > context.threshold", "next": [{"type": "pass", "result": "big"}]},
    ],
    "default": [{"type": "pass", "result": "small"}],
  }]);

  let big = executor
    .execute(&trigger(chain.clone()), &event(json!({"amount": 42})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(big.status, InstanceStatus::Succeeded);
  assert_eq!(big.output, json!("big"));

  let small = executor
    .execute(&trigger(chain), &event(json!({"amount": 2})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(small.output, json!("small"));
}

#[tokio::test]
async fn test_choice_without_default_fails_when_nothing_matches() {
  let executor = ActionExecutor::new(TaskRegistry::new(), ExecutorConfig::default());
  let chain = json!([{
    "type": "choice",
    "choices": [{"condition": "state.amount > 1000", "next": []}],
  }]);

  let instance = executor
    .execute(&trigger(chain), &event(json!({"amount": 1})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(instance.status, InstanceStatus::Failed);
  assert!(instance.error.unwrap().contains("no-matching-choice"));
}

#[tokio::test]
async fn test_end_inside_choice_stops_outer_chain() {
  let executor = ActionExecutor::new(TaskRegistry::new(), ExecutorConfig::default());
  let chain = json!([
    {
      "type": "choice",
      "choices": [{"condition": "true", "next": [{"type": "pass", "result": "stopped"}, {"type": "end"}]}],
    },
    {"type": "pass", "result": "unreachable"},
  ]);

  let instance = executor
    .execute(&trigger(chain), &event(json!({})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(instance.status, InstanceStatus::Succeeded);
  assert_eq!(instance.output, json!("stopped"));
}

#[tokio::test]
async fn test_parallel_collects_branch_outputs() {
  let executor = ActionExecutor::new(TaskRegistry::with_builtins(), ExecutorConfig::default());
  let chain = json!([{
    "type": "parallel",
    "branches": [
      [{"type": "task", "task": "echo"}],
      [{"type": "pass", "result": 2}],
      [],
    ],
  }]);

  let instance = executor
    .execute(&trigger(chain), &event(json!({"n": 1})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(instance.status, InstanceStatus::Succeeded);
  assert_eq!(instance.output, json!([{"n": 1}, 2, {"n": 1}]));
}

#[tokio::test]
async fn test_parallel_failure_cancels_each_sibling_once() {
  let observed = Arc::new(AtomicU32::new(0));
  let mut tasks = TaskRegistry::new();
  tasks.register_fn("boom", |_req: TaskRequest, _cancel| async move {
    tokio::time::sleep(Duration::from_millis(20)).await;
    Err(TaskFailure::Permanent("boom".into()))
  });
  let seen = observed.clone();
  tasks.register_fn("slow", move |_req: TaskRequest, cancel: CancellationToken| {
    let seen = seen.clone();
    async move {
      tokio::select! {
        _ = cancel.cancelled() => {
          seen.fetch_add(1, Ordering::SeqCst);
          Err(TaskFailure::Cancelled)
        }
        _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(json!("finished")),
      }
    }
  });

  let (tx, mut rx) = mpsc::unbounded_channel();
  let executor = ActionExecutor::with_notifier(tasks, ExecutorConfig::default(), ChannelNotifier::new(tx));
  let chain = json!([{
    "type": "parallel",
    "branches": [
      [{"type": "task", "task": "boom", "retry": {"max_attempts": 1}}],
      [{"type": "task", "task": "slow"}],
      [{"type": "task", "task": "slow"}],
    ],
  }]);

  let instance = executor
    .execute(&trigger(chain), &event(json!({})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(instance.status, InstanceStatus::Failed);
  assert!(instance.error.unwrap().contains("boom"));
  assert_eq!(observed.load(Ordering::SeqCst), 2);

  let mut cancelled: Vec<usize> = drain(&mut rx)
    .into_iter()
    .filter_map(|event| match event {
      ExecutionEvent::BranchCancelled { branch, step, .. } => {
        assert_eq!(step, "0");
        Some(branch)
      }
      _ => None,
    })
    .collect();
  cancelled.sort();
  assert_eq!(cancelled, vec![1, 2]);
}

fn failing_on(values: &'static [i64]) -> TaskRegistry {
  let mut tasks = TaskRegistry::new();
  tasks.register_fn("check", move |req: TaskRequest, _cancel| async move {
    let n = req.input.as_i64().unwrap_or_default();
    if values.contains(&n) {
      Err(TaskFailure::Permanent(format!("bad item {}", n)))
    } else {
      Ok(json!(n * 10))
    }
  });
  tasks
}

#[tokio::test]
async fn test_map_tolerates_failures_up_to_limit() {
  let executor = ActionExecutor::new(failing_on(&[3]), ExecutorConfig::default());
  let chain = json!([{
    "type": "map",
    "items": "state.items",
    "max_concurrency": 2,
    "tolerated_failure_count": 1,
    "iterator": [{"type": "task", "task": "check", "retry": {"max_attempts": 1}}],
  }]);

  let instance = executor
    .execute(&trigger(chain), &event(json!({"items": [1, 2, 3, 4, 5]})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(instance.status, InstanceStatus::Succeeded);
  assert_eq!(instance.output, json!([10, 20, null, 40, 50]));
  assert_eq!(instance.element_failures.len(), 1);
  assert_eq!(instance.element_failures[0].index, 2);
  assert_eq!(instance.element_failures[0].path, "0");
  assert!(instance.element_failures[0].error.contains("bad item 3"));
}

#[tokio::test]
async fn test_map_fails_past_tolerance() {
  let executor = ActionExecutor::new(failing_on(&[2, 4]), ExecutorConfig::default());
  let chain = json!([{
    "type": "map",
    "tolerated_failure_count": 1,
    "iterator": [{"type": "task", "task": "check", "retry": {"max_attempts": 1}}],
  }]);

  let instance = executor
    .execute(&trigger(chain), &event(json!([1, 2, 3, 4, 5])), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(instance.status, InstanceStatus::Failed);
  assert!(instance.error.unwrap().contains("exceeded tolerated failures"));
  assert_eq!(instance.element_failures.len(), 2);
}

#[tokio::test]
async fn test_map_items_must_be_array() {
  let executor = ActionExecutor::new(TaskRegistry::new(), ExecutorConfig::default());
  let chain = json!([{"type": "map", "iterator": []}]);

  let instance = executor
    .execute(&trigger(chain), &event(json!({"not": "a list"})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(instance.status, InstanceStatus::Failed);
  assert!(instance.error.unwrap().contains("not an array"));
}

#[tokio::test]
async fn test_task_retries_transient_failures() {
  let attempts = Arc::new(AtomicU32::new(0));
  let counter = attempts.clone();
  let mut tasks = TaskRegistry::new();
  tasks.register_fn("flaky", move |req: TaskRequest, _cancel| {
    let counter = counter.clone();
    async move {
      counter.fetch_add(1, Ordering::SeqCst);
      if req.attempt < 3 {
        Err(TaskFailure::Transient("try again".into()))
      } else {
        Ok(json!({"attempt": req.attempt}))
      }
    }
  });
  let executor = ActionExecutor::new(tasks, ExecutorConfig::default());
  let chain = json!([{
    "type": "task",
    "task": "flaky",
    "retry": {"max_attempts": 3, "interval_ms": 1},
  }]);

  let instance = executor
    .execute(&trigger(chain), &event(json!({})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(instance.status, InstanceStatus::Succeeded);
  assert_eq!(instance.output, json!({"attempt": 3}));
  assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_task_gives_up_after_max_attempts() {
  let mut tasks = TaskRegistry::new();
  tasks.register_fn("down", |_req: TaskRequest, _cancel| async move {
    Err(TaskFailure::Transient("connection refused".into()))
  });
  let executor = ActionExecutor::new(tasks, ExecutorConfig::default());
  let chain = json!([{
    "type": "task",
    "task": "down",
    "retry": {"max_attempts": 2, "interval_ms": 1},
  }]);

  let instance = executor
    .execute(&trigger(chain), &event(json!({})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(instance.status, InstanceStatus::Failed);
  let error = instance.error.unwrap();
  assert!(error.contains("after 2 attempts"));
  assert!(error.contains("connection refused"));
}

#[tokio::test]
async fn test_task_timeout_counts_as_failure() {
  let mut tasks = TaskRegistry::new();
  tasks.register_fn("stuck", |_req: TaskRequest, _cancel| async move {
    tokio::time::sleep(Duration::from_secs(10)).await;
    Ok(json!(null))
  });
  let executor = ActionExecutor::new(tasks, ExecutorConfig::default());
  let chain = json!([{
    "type": "task",
    "task": "stuck",
    "timeout_ms": 20,
    "retry": {"max_attempts": 1},
  }]);

  let instance = executor
    .execute(&trigger(chain), &event(json!({})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(instance.status, InstanceStatus::Failed);
  assert!(instance.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_unknown_task_handler_fails() {
  let executor = ActionExecutor::new(TaskRegistry::new(), ExecutorConfig::default());
  let chain = json!([{"type": "task", "task": "nowhere"}]);

  let instance = executor
    .execute(&trigger(chain), &event(json!({})), Arc::new(NoopJournal), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(instance.status, InstanceStatus::Failed);
  assert!(instance.error.unwrap().contains("unknown task handler"));
}

#[tokio::test]
async fn test_journal_skips_completed_tasks() {
  let first_calls = Arc::new(AtomicU32::new(0));
  let second_broken = Arc::new(AtomicBool::new(true));

  let mut tasks = TaskRegistry::new();
  let calls = first_calls.clone();
  tasks.register_fn("charge", move |req: TaskRequest, _cancel| {
    let calls = calls.clone();
    async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok(json!({"charged": req.input["amount"]}))
    }
  });
  let broken = second_broken.clone();
  tasks.register_fn("notify", move |req: TaskRequest, _cancel| {
    let broken = broken.clone();
    async move {
      if broken.load(Ordering::SeqCst) {
        Err(TaskFailure::Permanent("mail server down".into()))
      } else {
        Ok(req.input)
      }
    }
  });

  let executor = ActionExecutor::new(tasks, ExecutorConfig::default());
  let chain = trigger(json!([
    {"type": "task", "task": "charge"},
    {"type": "task", "task": "notify"},
  ]));
  let journal = Arc::new(InMemoryJournal::new());

  let first = executor
    .execute(&chain, &event(json!({"amount": 5})), journal.clone(), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(first.status, InstanceStatus::Failed);
  assert_eq!(journal.len().await, 1);

  second_broken.store(false, Ordering::SeqCst);
  let second = executor
    .execute(&chain, &event(json!({"amount": 5})), journal.clone(), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(second.status, InstanceStatus::Succeeded);
  assert_eq!(second.output, json!({"charged": 5}));
  assert_eq!(first_calls.load(Ordering::SeqCst), 1);

  journal.release().await.unwrap();
  assert_eq!(journal.len().await, 0);
}

#[tokio::test]
async fn test_cancel_during_retry_backoff() {
  let mut tasks = TaskRegistry::new();
  tasks.register_fn("down", |_req: TaskRequest, _cancel| async move {
    Err(TaskFailure::Transient("unavailable".into()))
  });
  let executor = ActionExecutor::new(tasks, ExecutorConfig::default());
  let chain = json!([{
    "type": "task",
    "task": "down",
    "retry": {"max_attempts": 5, "interval_ms": 10000, "backoff": "constant"},
  }]);

  let cancel = CancellationToken::new();
  let trigger = trigger(chain);
  let event = event(json!({}));
  let run = executor.execute(&trigger, &event, Arc::new(NoopJournal), cancel.clone());

  let canceller = async {
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
  };
  let (instance, _) = tokio::join!(run, canceller);

  let instance = instance.unwrap();
  assert_eq!(instance.status, InstanceStatus::Cancelled);
}

#[tokio::test]
async fn test_task_cancelling_itself_fails_instance() {
  let mut tasks = TaskRegistry::new();
  tasks.register_fn("quit", |_req: TaskRequest, _cancel| async move {
    Err(TaskFailure::Cancelled)
  });
  let executor = ActionExecutor::new(tasks, ExecutorConfig::default());

  let instance = executor
    .execute(
      &trigger(json!([{"type": "task", "task": "quit"}])),
      &event(json!({})),
      Arc::new(NoopJournal),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(instance.status, InstanceStatus::Failed);
  assert!(instance.error.is_some());
}
