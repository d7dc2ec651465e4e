//! Todo Counter Example
//!
//! Walks through the engine with a small todo list: computed values,
//! path and selector subscriptions, batching and an async load that is
//! superseded by a second one.
//!
//! Run with: `cargo run -p reactive-state --example todo_counter`
//! Set `STATE_LOG_MODE=development` to see the engine's tracing output.

use std::time::Duration;

use reactive_state::prelude::*;
use reactive_state::{init_logging_from_env, operation, TransitionError};
use serde_json::json;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    println!("📝 Reactive State Todo Counter");
    println!("==============================\n");

    let engine = StateEngine::builder(json!({ "todos": [], "filter": "all" }))
        .computed("remaining", |s| {
            let open = s
                .get("todos")
                .items()
                .iter()
                .filter(|todo| todo.get("done").as_bool() != Some(true))
                .count();
            Ok(Value::from(open))
        })
        .computed("summary", |s| {
            let remaining = s.computed("remaining").and_then(|v| v.as_f64()).unwrap_or(0.0);
            Ok(Value::from(format!("{} left", remaining)))
        })
        .operation(
            "load",
            operation(|args, _signal| async move {
                let delay = args.first().and_then(Value::as_f64).unwrap_or(0.0) as u64;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, TransitionError>(Value::from(json!({
                    "todos": [
                        { "title": format!("fetched after {}ms", delay), "done": false },
                        { "title": "water plants", "done": true }
                    ]
                })))
            }),
        )
        .config(StoreConfig::default().with_flush_mode(FlushMode::Sync))
        .build()?;

    // Demo 1: path subscription
    println!("🚀 Demo 1: Path Subscription");
    let todos_sub = engine.subscribe(&["todos"], |event| {
        let count = event.state.get("todos").map(Value::len).unwrap_or(0);
        println!("  📬 todos changed ({} items)", count);
    })?;

    // Demo 2: selector on a computed value
    println!("\n🚀 Demo 2: Selector Subscription");
    let summary_sub = engine.subscribe_selector(
        |s| Ok(s.computed("summary").unwrap_or_default()),
        SelectorOptions::default().fire_immediately(),
        |summary| println!("  🔢 {}", summary.as_str().unwrap_or("?")),
    );

    engine.set_state(
        json!({ "todos": [{ "title": "write docs", "done": false }] }),
        SetStateOptions::default(),
    )?;
    engine.set_state(true, SetStateOptions::at(Path::parse("todos[0].done")?))?;

    // Unrelated change: no selector output
    engine.set_state(json!({ "filter": "active" }), SetStateOptions::default())?;

    // Demo 3: superseded async loads
    println!("\n🚀 Demo 3: Async Loads");
    let (first, second) = tokio::join!(
        engine.invoke_async("load", vec![Value::from(200)]),
        engine.invoke_async("load", vec![Value::from(50)]),
    );
    println!("  ⏳ slow load superseded: {}", first?.is_superseded());
    println!("  ✅ fast load applied: {}", second?.is_success());
    println!("  📊 status: {:?}", engine.get_async_status("load"));

    println!("\n📋 Final state: {:?}", engine.get_state());
    println!("🧮 Computed order: {:?}", engine.computed_order());

    todos_sub.dispose();
    summary_sub.dispose();
    println!("\n✨ Done!");

    Ok(())
}
