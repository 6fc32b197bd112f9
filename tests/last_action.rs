use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use orderly::{ActionError, Deferred, LastAction, Promise, promise_ext::IntoPromise, sleep};

#[test]
fn last_action_drops_superseded() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let actions = LastAction::<u32, String>::new();

    let in_flight = Deferred::new();
    let in_flight_promise = in_flight.promise();
    let calls_cl = Arc::clone(&calls);
    let first = actions.push(move |_| {
        calls_cl.lock().unwrap().push("first");
        in_flight_promise.clone()
    });
    assert!(actions.is_busy());

    let calls_cl = Arc::clone(&calls);
    let second = actions.push(move |_| {
        calls_cl.lock().unwrap().push("second");
        Promise::resolved(2)
    });
    let calls_cl = Arc::clone(&calls);
    let third = actions.push(move |previous| {
        calls_cl.lock().unwrap().push("third");
        match previous {
            Some(Ok(value)) => Promise::resolved(value * 10),
            _ => Promise::rejected("missing input".to_string()),
        }
    });

    assert_eq!(
        second.outcome(),
        Some(Err(ActionError::Superseded)),
        "Superseded push settles right away"
    );
    assert!(third.is_pending());

    in_flight.resolve(1);
    assert_eq!(*calls.lock().unwrap(), vec!["first", "third"]);
    assert_eq!(first.outcome(), Some(Ok(1)));
    assert_eq!(third.outcome(), Some(Ok(10)));
    assert!(!actions.is_busy());
    assert_eq!(actions.last_response(), Some(Ok(10)));
}

#[test]
fn last_action_retry_count() {
    let calls = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_cl = Arc::clone(&errors);

    let actions = LastAction::<(), String>::builder()
        .retries(2)
        .on_error(move |error| errors_cl.lock().unwrap().push(error.clone()))
        .on_complete(|_| panic!("Nothing completes"))
        .build();

    let calls_cl = Arc::clone(&calls);
    let pushed = actions.push(move |_| {
        let attempt = calls_cl.fetch_add(1, Ordering::Relaxed);
        Promise::rejected(format!("attempt {attempt}"))
    });

    assert_eq!(calls.load(Ordering::Relaxed), 3, "1 initial call and 2 retries");
    assert_eq!(
        pushed.outcome(),
        Some(Err(ActionError::Failed("attempt 2".to_string())))
    );
    assert_eq!(
        *errors.lock().unwrap(),
        vec!["attempt 2".to_string()],
        "Error hook fires once, after the last retry"
    );
    assert!(!actions.is_busy());
}

#[test]
fn last_action_retry_succeeds() {
    let calls = Arc::new(AtomicUsize::new(0));
    let actions = LastAction::<usize, ()>::new();

    let calls_cl = Arc::clone(&calls);
    let pushed = actions.push_with_retries(
        move |_| {
            let attempt = calls_cl.fetch_add(1, Ordering::Relaxed);
            if attempt < 3 {
                Promise::rejected(())
            } else {
                Promise::resolved(attempt)
            }
        },
        5,
    );

    assert_eq!(pushed.outcome(), Some(Ok(3)));
    assert_eq!(calls.load(Ordering::Relaxed), 4);
}

#[test]
fn last_action_synchronous_retries_stay_flat() {
    let calls = Arc::new(AtomicUsize::new(0));
    let actions = LastAction::<(), ()>::new();

    let calls_cl = Arc::clone(&calls);
    let pushed = actions.push_with_retries(
        move |_| {
            calls_cl.fetch_add(1, Ordering::Relaxed);
            Promise::rejected(())
        },
        100_000,
    );

    assert_eq!(calls.load(Ordering::Relaxed), 100_001);
    assert_eq!(pushed.outcome(), Some(Err(ActionError::Failed(()))));
}

#[test]
fn last_action_retries_dropped_when_superseded() {
    let calls = Arc::new(AtomicUsize::new(0));
    let actions = LastAction::<u32, &str>::new();

    let in_flight = Deferred::new();
    let in_flight_promise = in_flight.promise();
    let calls_cl = Arc::clone(&calls);
    let first = actions.push_with_retries(
        move |_| {
            calls_cl.fetch_add(1, Ordering::Relaxed);
            in_flight_promise.clone()
        },
        5,
    );
    let second = actions.push(|previous| {
        assert_eq!(previous, Some(Err("down")), "Failures are fed forward");
        Promise::resolved(2)
    });

    in_flight.reject("down");
    assert_eq!(calls.load(Ordering::Relaxed), 1, "No retry once superseded");
    assert_eq!(first.outcome(), Some(Err(ActionError::Failed("down"))));
    assert_eq!(second.outcome(), Some(Ok(2)));
}

#[test]
fn last_action_hooks_only_for_latest() {
    let completed = Arc::new(Mutex::new(Vec::new()));
    let completed_cl = Arc::clone(&completed);
    let actions = LastAction::<u32, ()>::builder()
        .on_complete(move |value| completed_cl.lock().unwrap().push(*value))
        .build();

    let in_flight = Deferred::new();
    let in_flight_promise = in_flight.promise();
    actions.push(move |_| in_flight_promise.clone());
    let waiting = Deferred::new();
    let waiting_promise = waiting.promise();
    actions.push(move |_| waiting_promise.clone());
    assert!(actions.has_waiting());

    in_flight.resolve(1);
    assert!(
        completed.lock().unwrap().is_empty(),
        "Completion hook skipped while a newer action waits"
    );
    assert!(actions.is_busy());

    waiting.resolve(2);
    assert_eq!(*completed.lock().unwrap(), vec![2]);
    assert_eq!(actions.last_response(), Some(Ok(2)));
}

#[test]
fn last_action_superseded_outcome_skips_last_response() {
    let actions = LastAction::<u32, ()>::new();
    let input = Arc::new(Mutex::new(None));

    let in_flight = Deferred::new();
    let in_flight_promise = in_flight.promise();
    actions.push(move |_| in_flight_promise.clone());

    let waiting = Deferred::new();
    let waiting_promise = waiting.promise();
    let input_cl = Arc::clone(&input);
    actions.push(move |previous| {
        *input_cl.lock().unwrap() = Some(previous);
        waiting_promise.clone()
    });

    in_flight.resolve(1);
    assert_eq!(
        *input.lock().unwrap(),
        Some(Some(Ok(1))),
        "Waiting action receives the superseded outcome"
    );
    assert_eq!(actions.last_response(), None);

    waiting.resolve(2);
    assert_eq!(actions.last_response(), Some(Ok(2)));
}

#[test]
fn last_action_feeds_previous_response() {
    let actions = LastAction::<u32, ()>::new();
    let first = actions.push(|previous| {
        assert!(previous.is_none(), "First action has no input");
        Promise::resolved(1)
    });
    let second = actions.push(|previous| match previous {
        Some(Ok(value)) => Promise::resolved(value + 1),
        _ => Promise::rejected(()),
    });

    assert_eq!(first.outcome(), Some(Ok(1)));
    assert_eq!(second.outcome(), Some(Ok(2)));
    assert!(actions.last_action().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn last_action_async() {
    let actions = LastAction::<String, ()>::builder().retries(1).build();
    let calls = Arc::new(AtomicUsize::new(0));

    let calls_cl = Arc::clone(&calls);
    let first = actions.push(move |_| {
        let attempt = calls_cl.fetch_add(1, Ordering::Relaxed);
        async move {
            sleep(Duration::from_millis(10)).await.ok();
            if attempt == 0 {
                Err(())
            } else {
                Ok("Result".to_string())
            }
        }
        .into_promise()
    });

    assert_eq!(first.await, Ok("Result".to_string()));
    assert_eq!(calls.load(Ordering::Relaxed), 2, "One failure and one retry");
    assert!(!actions.is_busy());
}
