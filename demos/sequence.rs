use std::time::Duration;

use orderly::{Sequence, Step, promise_ext::IntoPromise, sleep};
use tracing::Level;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(Level::TRACE).init();

    let sequence = Sequence::<u32, String>::from_steps([
        Step::action(|deferred, _| {
            println!("first");
            deferred.reject("Help me, third step. You're my only hope".to_string());
        }),
        Step::action(|deferred, _| {
            println!("I'll never be called but I don't care");
            deferred.resolve(0);
        }),
        Step::action_with_fallback(
            |deferred, _| deferred.resolve(0),
            |_, message| {
                println!("third: I survived the failure");
                println!("A message!: {message} ...a little too late");
                async {
                    sleep(Duration::from_millis(100)).await.ok();
                    println!("finally solved");
                    Ok::<_, String>(3)
                }
                .into_promise()
            },
        ),
    ]);

    sequence
        .push_synchronous(|value| value + 1)
        .push(|deferred, value| {
            println!("everything is fine at last: {value}");
            deferred.resolve(value);
        })
        // Never settles on its own, the timeout takes over.
        .push(|_, _| ())
        .set_timeout(
            |deferred| deferred.reject("gave up waiting".to_string()),
            Duration::from_millis(300),
        );
    let timed_out = sequence.promise();

    sequence.when_empty_with_fallback(
        |deferred, value| {
            println!("nothing left to do, last value {value}");
            deferred.resolve(value);
        },
        |deferred, error| {
            println!("nothing left to do, last error: {error}");
            deferred.resolve(0);
        },
    );

    println!("{:?}", timed_out.await);
    println!("{:?}", sequence.promise().await);
}
