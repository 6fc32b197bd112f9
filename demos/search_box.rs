use std::time::Duration;

use orderly::{LastAction, OrderedPromises, Promise, promise_ext::IntoPromise, sleep};
use tracing::Level;

// Pretends to query a server; longer queries take less time to answer.
fn search(query: &'static str) -> Promise<String, String> {
    let latency = Duration::from_millis(200 / query.len() as u64);
    async move {
        sleep(latency).await.ok();
        Ok(format!("results for `{query}`"))
    }
    .into_promise()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::TRACE).init();

    // Every keystroke fires a request, only the freshest answer is shown.
    let suggestions = OrderedPromises::new();
    suggestions
        .on_next(|_, results| println!("Showing {results}"))
        .on_discarded(|_| println!("Dropping a stale answer"))
        .on_last(|_, _| println!("Caught up with the typing"));

    for query in ["r", "ru", "rus", "rust"] {
        suggestions.push(search(query));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Saving the query runs one request at a time, skipping intermediate states.
    let saves = LastAction::<String, String>::builder()
        .retries(2)
        .on_complete(|saved| println!("Saved: {saved}"))
        .on_error(|error| println!("Could not save: {error}"))
        .build();

    let mut pushed = Vec::new();
    for query in ["r", "ru", "rus", "rust"] {
        pushed.push(saves.push(move |_| search(query)));
    }
    for (query, outcome) in ["r", "ru", "rus", "rust"].into_iter().zip(pushed) {
        match outcome.await {
            Ok(saved) => println!("`{query}` push: {saved}"),
            Err(error) => println!("`{query}` push: {error}"),
        }
    }
}
