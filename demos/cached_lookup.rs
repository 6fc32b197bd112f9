use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use orderly::{EntryOptions, PromiseCache, promise_ext::IntoPromise, sleep};
use tracing::Level;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::TRACE).init();

    let cache = PromiseCache::<u32, String, String>::builder()
        .eviction("lru".parse().expect("Known eviction policy"))
        .capacity(3)
        .expire_after(Duration::from_millis(300))
        .on_discarded(|user, _| println!("Forgetting user {user}"))
        .build()
        .expect("Valid cache configuration");

    let requests = Arc::new(AtomicU32::new(0));
    let lookup = |user: u32| {
        if let Some(cached) = cache.get(&user) {
            return cached;
        }
        let requests = Arc::clone(&requests);
        let request = async move {
            requests.fetch_add(1, Ordering::Relaxed);
            sleep(Duration::from_millis(20)).await.ok();
            if user == 13 {
                Err("unlucky user".to_string())
            } else {
                Ok(format!("user #{user}"))
            }
        }
        .into_promise();
        cache.set(user, request)
    };

    // Concurrent lookups of one user share a single request.
    let (a, b) = (lookup(1), lookup(1));
    println!("{:?} {:?}", a.await, b.await);
    for user in 2..=4 {
        lookup(user).await.ok();
    }
    println!("Requests so far: {}", requests.load(Ordering::Relaxed));

    // Failed lookups are not cached, unless a fail hook recovers them.
    println!("{:?}", lookup(13).await);
    let recovered = cache.set_with(
        13,
        async { Err::<String, _>("still unlucky".to_string()) }.into_promise(),
        EntryOptions::new().on_fail(|deferred, user, _| {
            deferred.resolve(format!("guest instead of user #{user}"))
        }),
    );
    println!("{:?}", recovered.await);

    tokio::time::sleep(Duration::from_millis(400)).await;
    println!("Cached after expiry: {}", cache.len());
}
