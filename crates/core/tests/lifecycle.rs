//! End-to-end lifecycle scenarios against the in-process middleware.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use gantry::{
    Connection, ConnectionConfig, CrossThreadEvent, InboxCallbacks, SubscriptionCallbacks,
    WildcardCallbacks,
};
use gantry_middleware::{Msg, Transport};
use gantry_testing::{LocalBridge, LoopbackTransport};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_config() -> ConnectionConfig {
    ConnectionConfig::new().with_reaper_interval(Duration::from_millis(50))
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn timer_ticks_until_destroyed() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create(LocalBridge::new())?;
    let session = conn.create_session()?;

    let ticks = Arc::new(AtomicUsize::new(0));
    let timer = {
        let ticks = ticks.clone();
        session.create_timer(Duration::from_millis(50), move |_| {
            ticks.fetch_add(1, Ordering::SeqCst);
        })?
    };

    thread::sleep(Duration::from_millis(400));
    assert!(ticks.load(Ordering::SeqCst) >= 4);

    session.destroy_timer(timer)?;
    // allow a tick already in flight to finish
    thread::sleep(Duration::from_millis(100));
    let frozen = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(250));
    assert_eq!(ticks.load(Ordering::SeqCst), frozen);

    conn.destroy_session(&session)?;
    conn.destroy()?;
    Ok(())
}

#[test]
fn subscription_destroyed_from_its_own_callback() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create(LocalBridge::new())?;
    let session = conn.create_session()?;
    let transport = LoopbackTransport::new("loop");
    let transport_dyn: Arc<dyn Transport> = transport.clone();

    let hits = Arc::new(AtomicUsize::new(0));
    let callbacks = {
        let hits = hits.clone();
        let session = session.clone();
        SubscriptionCallbacks::new().on_msg(move |id, _msg| {
            hits.fetch_add(1, Ordering::SeqCst);
            // destroying the object from inside its own callback must not
            // deadlock and must stop further deliveries
            session.destroy_subscription(id).unwrap();
        })
    };
    session.create_basic_subscription(&transport_dyn, "ticker.X", callbacks)?;

    transport.publish("ticker.X", Msg::new(&b"m1"[..]));
    assert!(wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) == 1
    }));

    transport.publish("ticker.X", Msg::new(&b"m2"[..]));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    conn.destroy_session(&session)?;
    conn.destroy()?;
    Ok(())
}

#[test]
fn wildcard_subscription_sees_matched_topics() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create(LocalBridge::new())?;
    let session = conn.create_session()?;
    let transport = LoopbackTransport::new("loop");
    let transport_dyn: Arc<dyn Transport> = transport.clone();

    let topics = Arc::new(std::sync::Mutex::new(Vec::new()));
    let created = Arc::new(AtomicBool::new(false));
    let callbacks = {
        let topics = topics.clone();
        let created = created.clone();
        WildcardCallbacks::new()
            .on_create(move |_| created.store(true, Ordering::SeqCst))
            .on_msg(move |_, topic, _msg| topics.lock().unwrap().push(topic.to_owned()))
    };
    let sub = session.create_wildcard_subscription(&transport_dyn, "feed", "*", callbacks)?;

    transport.publish("feed.A", Msg::default());
    transport.publish("feed.B", Msg::default());
    transport.publish("other.A", Msg::default());
    assert!(wait_until(Duration::from_secs(2), || {
        topics.lock().unwrap().len() == 2
    }));
    assert!(created.load(Ordering::SeqCst));
    assert_eq!(
        *topics.lock().unwrap(),
        vec!["feed.A".to_owned(), "feed.B".to_owned()]
    );

    session.destroy_subscription(sub)?;
    conn.destroy_session(&session)?;
    conn.destroy()?;
    Ok(())
}

#[test]
fn inbox_receives_messages_and_errors() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create(LocalBridge::new())?;
    let session = conn.create_session()?;
    let transport = LoopbackTransport::new("loop");
    let transport_dyn: Arc<dyn Transport> = transport.clone();

    let msgs = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let callbacks = {
        let msgs = msgs.clone();
        let errors = errors.clone();
        InboxCallbacks::new(move |_, msg| {
            assert_eq!(msg.payload(), b"reply");
            msgs.fetch_add(1, Ordering::SeqCst);
        })
        .on_error(move |_, _| {
            errors.fetch_add(1, Ordering::SeqCst);
        })
    };
    let inbox = session.create_inbox(&transport_dyn, callbacks)?;

    assert!(transport.post_inbox(inbox.handle(), Msg::new(&b"reply"[..])));
    assert!(transport.post_inbox_error(
        inbox.handle(),
        gantry_middleware::MiddlewareError::Platform("nak".into())
    ));
    assert!(wait_until(Duration::from_secs(2), || {
        msgs.load(Ordering::SeqCst) == 1 && errors.load(Ordering::SeqCst) == 1
    }));

    session.destroy_inbox(inbox)?;
    // the transport no longer knows the inbox once destruction drains
    assert!(wait_until(Duration::from_secs(2), || {
        !transport.post_inbox(inbox.handle(), Msg::default())
    }));

    conn.destroy_session(&session)?;
    conn.destroy()?;
    Ok(())
}

#[test]
fn teardown_with_pending_work_stops_all_timers() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create_with_config(LocalBridge::new(), fast_config())?;
    let ticks = Arc::new(AtomicUsize::new(0));

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let session = conn.create_session()?;
        for _ in 0..10 {
            let ticks = ticks.clone();
            session.create_timer(Duration::from_millis(50), move |_| {
                ticks.fetch_add(1, Ordering::SeqCst);
            })?;
        }
        sessions.push(session);
    }

    thread::sleep(Duration::from_millis(500));
    assert!(ticks.load(Ordering::SeqCst) > 0);

    let start = Instant::now();
    conn.destroy()?;
    assert!(start.elapsed() < Duration::from_secs(5));

    // nothing may fire once destroy has returned
    let frozen = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(250));
    assert_eq!(ticks.load(Ordering::SeqCst), frozen);
    Ok(())
}

#[test]
fn cross_thread_inbox_churn() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create_with_config(LocalBridge::new(), fast_config())?;
    let session = conn.create_session()?;
    let transport = LoopbackTransport::new("loop");
    let transport_dyn: Arc<dyn Transport> = transport.clone();

    let stop = Arc::new(AtomicBool::new(false));
    let (id_tx, id_rx) = std::sync::mpsc::channel();

    let creator = {
        let session = session.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let id = session
                    .create_inbox(&transport_dyn, InboxCallbacks::new(|_, _| {}))
                    .expect("inbox creation failed during churn");
                if id_tx.send(id).is_err() {
                    break;
                }
            }
        })
    };
    let destroyer = {
        let session = session.clone();
        thread::spawn(move || {
            for id in id_rx {
                session.destroy_inbox(id).expect("inbox destroy failed");
            }
        })
    };

    thread::sleep(Duration::from_secs(1));
    stop.store(true, Ordering::SeqCst);
    creator.join().unwrap();
    destroyer.join().unwrap();

    conn.destroy_session(&session)?;
    conn.destroy()?;
    Ok(())
}

#[test]
fn shutdown_blocks_on_an_inflight_callback() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create(LocalBridge::new())?;
    let session = conn.create_session()?;

    let entered = Arc::new(CrossThreadEvent::new());
    let count = Arc::new(AtomicUsize::new(0));
    let timer = {
        let entered = entered.clone();
        let count = count.clone();
        session.create_timer(Duration::from_millis(30), move |_| {
            entered.set();
            thread::sleep(Duration::from_millis(300));
            count.fetch_add(1, Ordering::SeqCst);
        })?
    };

    // the callback signals at entry and only bumps the counter 300ms
    // later; shutdown must wait that callback out, so the increment is
    // visible by the time it returns
    entered.wait();
    session.shutdown_timer(timer)?;
    assert!(count.load(Ordering::SeqCst) >= 1);

    let frozen = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::SeqCst), frozen);

    session.destroy_timer(timer)?;
    conn.destroy_session(&session)?;
    conn.destroy()?;
    Ok(())
}

#[test]
fn drain_pacing_finalizes_the_session() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create_with_config(LocalBridge::new(), fast_config())?;
    let session = conn.create_session()?;
    let transport = LoopbackTransport::new("loop");
    let transport_dyn: Arc<dyn Transport> = transport.clone();

    assert!(session.can_destroy().is_ok());

    let inbox = session.create_inbox(&transport_dyn, InboxCallbacks::new(|_, _| {}))?;
    assert_eq!(session.can_destroy(), Err(gantry::Error::QueueOpenObjects));

    session.destroy_inbox(inbox)?;
    assert!(wait_until(Duration::from_secs(2), || {
        session.can_destroy().is_ok()
    }));

    conn.destroy_session(&session)?;
    assert_eq!(conn.active_sessions(), 0);
    assert!(wait_until(Duration::from_secs(2), || {
        conn.draining_sessions() == 0
    }));

    conn.destroy()?;
    Ok(())
}

#[test]
fn destroy_laws_are_idempotent() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create(LocalBridge::new())?;
    let session = conn.create_session()?;
    let transport = LoopbackTransport::new("loop");
    let transport_dyn: Arc<dyn Transport> = transport.clone();

    let hits = Arc::new(AtomicUsize::new(0));
    let callbacks = {
        let hits = hits.clone();
        SubscriptionCallbacks::new().on_msg(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    };
    let sub = session.create_basic_subscription(&transport_dyn, "ticker.Y", callbacks)?;

    // shutdown followed by destroy behaves like destroy alone
    session.shutdown_subscription(sub)?;
    transport.publish("ticker.Y", Msg::default());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    session.destroy_subscription(sub)?;
    session.destroy_subscription(sub)?;

    // shutdown of an object that is gone reports the lookup miss
    assert_eq!(
        session.shutdown_subscription(sub),
        Err(gantry::Error::NotFound)
    );

    // destroying an already-destroyed session is also fine
    conn.destroy_session(&session)?;
    conn.destroy_session(&session)?;
    conn.destroy()?;
    Ok(())
}

#[test]
fn destroy_connection_with_active_sessions() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create_with_config(LocalBridge::new(), fast_config())?;
    for _ in 0..4 {
        conn.create_session()?;
    }
    assert_eq!(conn.active_sessions(), 4);
    conn.destroy()?;
    Ok(())
}

#[test]
fn creates_fail_on_a_draining_session() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create(LocalBridge::new())?;
    let session = conn.create_session()?;
    conn.destroy_session(&session)?;

    let err = session
        .create_timer(Duration::from_millis(10), |_| {})
        .unwrap_err();
    assert!(matches!(err, gantry::Error::InvalidArg(_)));

    conn.destroy()?;
    Ok(())
}

#[test]
fn shutdown_session_pauses_dispatch_until_destroy() -> anyhow::Result<()> {
    init_logging();
    let conn = Connection::create_with_config(LocalBridge::new(), fast_config())?;
    let session = conn.create_session()?;

    let ticks = Arc::new(AtomicUsize::new(0));
    {
        let ticks = ticks.clone();
        session.create_timer(Duration::from_millis(20), move |_| {
            ticks.fetch_add(1, Ordering::SeqCst);
        })?;
    }
    assert!(wait_until(Duration::from_secs(2), || {
        ticks.load(Ordering::SeqCst) > 0
    }));

    conn.shutdown_session(&session)?;
    thread::sleep(Duration::from_millis(100));
    let frozen = ticks.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(200));
    // paused dispatch: ticks pile up on the queue but no callback runs
    assert_eq!(ticks.load(Ordering::SeqCst), frozen);

    // destroy still drains and finalizes the shut-down session
    conn.destroy_session(&session)?;
    assert!(wait_until(Duration::from_secs(2), || {
        conn.draining_sessions() == 0
    }));
    conn.destroy()?;
    Ok(())
}
