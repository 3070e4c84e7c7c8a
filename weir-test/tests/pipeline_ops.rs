//! Pipeline mutation tests.
//!
//! Every sequence of add/remove/replace must leave the name map and the
//! link order consistent, from the loop thread and from foreign threads
//! alike. A UDP channel serves as the carrier; no traffic is involved.

use std::sync::Arc;

use weir::channel::{ChannelConfig, SocketOptions};
use weir::error::{ChannelError, PipelineError};
use weir::transport::bind_udp;
use weir::{Channel, EventLoopGroup, Handler};
use weir_test::{init_tracing, query};

struct Noop;

impl Handler for Noop {}

fn carrier(group: &EventLoopGroup) -> weir::ChannelHandle {
    let addr = "127.0.0.1:0".parse().unwrap();
    let init: weir::channel::Initializer = Arc::new(|_ch: &Channel| {});
    let (handle, bound) = bind_udp(
        &group.next(),
        addr,
        ChannelConfig::default(),
        SocketOptions::default(),
        init,
    );
    assert_eq!(bound.await_done(), Ok(()));
    handle
}

#[test]
fn add_variants_keep_order() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();
    let handle = carrier(&group);

    handle.add_last("c", Noop).await_done().unwrap();
    handle.add_first("a", Noop).await_done().unwrap();
    handle.add_after("a", "b", Noop).await_done().unwrap();
    handle.add_before("c", "b2", Noop).await_done().unwrap();

    let names = query(&handle, |ch| ch.handler_names());
    assert_eq!(names, vec!["a", "b", "b2", "c"]);
    group.shutdown();
}

#[test]
fn duplicate_names_rejected() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();
    let handle = carrier(&group);

    handle.add_last("h", Noop).await_done().unwrap();
    let err = handle.add_last("h", Noop).await_done().unwrap_err();
    assert_eq!(
        err,
        ChannelError::Pipeline(PipelineError::DuplicateName("h".into()))
    );

    // The failed add left the pipeline untouched.
    let names = query(&handle, |ch| ch.handler_names());
    assert_eq!(names, vec!["h"]);
    group.shutdown();
}

#[test]
fn remove_from_foreign_thread_blocks_until_done() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();
    let handle = carrier(&group);

    handle.add_last("x", Noop).await_done().unwrap();
    handle.add_last("y", Noop).await_done().unwrap();

    // await_done returns only after the loop applied the removal, so the
    // follow-up query must not see "x" anymore.
    handle.remove_handler("x").await_done().unwrap();
    let names = query(&handle, |ch| ch.handler_names());
    assert_eq!(names, vec!["y"]);

    let err = handle.remove_handler("x").await_done().unwrap_err();
    assert_eq!(
        err,
        ChannelError::Pipeline(PipelineError::NotFound("x".into()))
    );
    group.shutdown();
}

#[test]
fn replace_keeps_position() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();
    let handle = carrier(&group);

    handle.add_last("first", Noop).await_done().unwrap();
    handle.add_last("mid", Noop).await_done().unwrap();
    handle.add_last("last", Noop).await_done().unwrap();

    handle
        .replace_handler("mid", "mid2", Noop)
        .await_done()
        .unwrap();
    let names = query(&handle, |ch| ch.handler_names());
    assert_eq!(names, vec!["first", "mid2", "last"]);
    group.shutdown();
}

#[test]
fn mutation_after_close_fails() {
    init_tracing();
    let group = EventLoopGroup::new(1).unwrap();
    let handle = carrier(&group);

    assert_eq!(handle.close().await_done(), Ok(()));
    let err = handle.add_last("late", Noop).await_done().unwrap_err();
    assert_eq!(err, ChannelError::Closed);
    group.shutdown();
}
