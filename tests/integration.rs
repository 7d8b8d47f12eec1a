//! End-to-end tests: a real [`Server`] and [`Client`] talking over an
//! in-memory duplex stream.

use std::time::Duration;

use serde_json::json;
use tokio::io::duplex;
use tokio::task::JoinHandle;

use objwire::{
    sync_value, ClassBuilder, Client, ClientArg, ClientValue, Error, HostValue, ObjectHandle,
    RemoteKind, Server,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connect(server: &Server) -> (Client, JoinHandle<objwire::Result<()>>) {
    init_tracing();
    let (peer, stream) = duplex(256 * 1024);
    let task = {
        let server = server.clone();
        tokio::spawn(async move { server.handle_connection(stream).await })
    };
    let client = Client::connect(peer).await.expect("handshake");
    (client, task)
}

/// Poll until `check` passes or a generous deadline expires.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn handshake_mirrors_the_root_graph() {
    let nested = ObjectHandle::new();
    nested.set("deep", true);
    let root = ObjectHandle::new();
    root.set("label", "root");
    root.set("nested", nested);
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    assert_eq!(client.identity_property(), "_objwire_id");

    let root = client.root_object().expect("root is an object");
    assert_eq!(root.kind(), RemoteKind::Object);
    assert_eq!(root.get("label").unwrap().as_str(), Some("root"));

    let nested = root.get("nested").unwrap();
    let nested = nested.as_remote().expect("nested is tracked");
    assert_eq!(nested.get("deep").unwrap().as_bool(), Some(true));

    // Reading the same property twice resolves to the same mirror.
    let again = root.get("nested").unwrap();
    assert!(nested.same_identity(again.as_remote().unwrap()));
}

#[tokio::test]
async fn cyclic_graphs_mirror_without_divergence() {
    let root = ObjectHandle::new();
    root.set("me", root.clone());
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    let root = client.root_object().unwrap();
    let me = root.get("me").unwrap();
    assert!(root.same_identity(me.as_remote().unwrap()));
}

#[tokio::test]
async fn repeated_returns_preserve_identity() {
    let shared = ObjectHandle::new();
    shared.set("name", "singleton");
    let root = ObjectHandle::new();
    root.set("shared", shared.clone());
    root.set("get_shared", {
        let shared = shared.clone();
        HostValue::function(move |_args| {
            let shared = shared.clone();
            async move { Ok(HostValue::Object(shared)) }
        })
    });
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    let root = client.root_object().unwrap();

    let first = root.call("get_shared", vec![]).await.unwrap();
    let second = root.call("get_shared", vec![]).await.unwrap();
    let first = first.as_remote().unwrap();
    assert!(first.same_identity(second.as_remote().unwrap()));

    // The property mirror and the returned mirror are the same object.
    let via_prop = root.get("shared").unwrap();
    assert!(first.same_identity(via_prop.as_remote().unwrap()));
}

#[tokio::test]
async fn reference_arguments_resolve_to_live_objects() {
    let shared = ObjectHandle::new();
    let root = ObjectHandle::new();
    root.set("shared", shared.clone());
    root.set("is_shared", {
        let shared = shared.clone();
        HostValue::function(move |args| {
            let shared = shared.clone();
            async move {
                let same = matches!(
                    args.first(),
                    Some(HostValue::Object(o)) if o.same_identity(&shared)
                );
                Ok(HostValue::Bool(same))
            }
        })
    });
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    let root = client.root_object().unwrap();
    let mirror = root.get("shared").unwrap();
    let mirror = mirror.as_remote().unwrap();

    let result = root
        .call("is_shared", vec![ClientArg::from(mirror)])
        .await
        .unwrap();
    assert_eq!(result.as_bool(), Some(true));

    let result = root
        .call("is_shared", vec![ClientArg::from(json!({"fresh": 1}))])
        .await
        .unwrap();
    assert_eq!(result.as_bool(), Some(false));
}

#[tokio::test]
async fn raw_json_arguments_become_host_data() {
    let root = ObjectHandle::new();
    root.set(
        "sum",
        HostValue::function(|args| async move {
            let Some(HostValue::Array(items)) = args.first() else {
                return Err(Error::Application("expected an array".to_string()));
            };
            let total: f64 = items
                .elements_snapshot()
                .iter()
                .filter_map(|item| match item {
                    HostValue::Number(n) => Some(*n),
                    _ => None,
                })
                .sum();
            Ok(HostValue::Number(total))
        }),
    );
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    let root = client.root_object().unwrap();
    let result = root
        .call("sum", vec![ClientArg::from(json!([1, 2, 3.5]))])
        .await
        .unwrap();
    assert_eq!(result.as_f64(), Some(6.5));
}

#[tokio::test]
async fn instances_construct_and_stay_in_sync() {
    let root = ObjectHandle::new();
    root.set(
        "Counter",
        ClassBuilder::new("Counter")
            .constructor(|instance, args| async move {
                let start = match args.first() {
                    Some(HostValue::Number(n)) => *n,
                    _ => 0.0,
                };
                instance.set("count", start);
                Ok(())
            })
            .method("increment", |this, _args| async move {
                let count = match this.get("count") {
                    Some(HostValue::Number(n)) => n,
                    _ => 0.0,
                };
                this.set("count", count + 1.0);
                Ok(HostValue::Number(count + 1.0))
            })
            .build(),
    );
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    let root = client.root_object().unwrap();
    let class = root.get("Counter").unwrap();
    let class = class.as_remote().unwrap();
    assert_eq!(class.kind(), RemoteKind::Function);
    assert_eq!(class.function_names(), vec!["increment".to_string()]);

    let counter = class.construct(vec![ClientArg::from(10.0)]).await.unwrap();
    assert_eq!(counter.get("count").unwrap().as_f64(), Some(10.0));
    assert_eq!(counter.function_names(), vec!["increment".to_string()]);

    let result = counter.call("increment", vec![]).await.unwrap();
    assert_eq!(result.as_f64(), Some(11.0));
    // The method's mutation rides back on the caller's response.
    assert_eq!(counter.get("count").unwrap().as_f64(), Some(11.0));

    // A second instance counts independently of the first.
    let other = class.construct(vec![ClientArg::from(3.0)]).await.unwrap();
    assert!(!other.same_identity(&counter));
    other.call("increment", vec![]).await.unwrap();
    assert_eq!(other.get("count").unwrap().as_f64(), Some(4.0));
    assert_eq!(counter.get("count").unwrap().as_f64(), Some(11.0));
}

#[tokio::test]
async fn static_factories_yield_independent_instances() {
    let class = ClassBuilder::new("Counter")
        .method("increment", |this, _args| async move {
            let count = match this.get("count") {
                Some(HostValue::Number(n)) => n,
                _ => 0.0,
            };
            this.set("count", count + 1.0);
            Ok(HostValue::Number(count + 1.0))
        })
        .build();
    let factory_class = class.clone();
    class.set(
        "create",
        HostValue::function(move |args| {
            let class = factory_class.clone();
            async move {
                let start = match args.first() {
                    Some(HostValue::Number(n)) => *n,
                    _ => 0.0,
                };
                let instance = class
                    .blank_instance()
                    .ok_or_else(|| Error::Application("not a class".to_string()))?;
                instance.set("count", start);
                Ok(HostValue::Object(instance))
            }
        }),
    );
    let root = ObjectHandle::new();
    root.set("Counter", class);
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    let root = client.root_object().unwrap();
    let class = root.get("Counter").unwrap();
    let class = class.as_remote().unwrap();
    assert_eq!(class.kind(), RemoteKind::Function);

    let first = class
        .call("create", vec![ClientArg::from(5.0)])
        .await
        .unwrap();
    let first = first.as_remote().unwrap().clone();
    let second = class
        .call("create", vec![ClientArg::from(5.0)])
        .await
        .unwrap();
    let second = second.as_remote().unwrap().clone();

    assert!(!first.same_identity(&second));
    assert_eq!(first.function_names(), vec!["increment".to_string()]);

    first.call("increment", vec![]).await.unwrap();
    first.call("increment", vec![]).await.unwrap();
    second.call("increment", vec![]).await.unwrap();
    assert_eq!(first.get("count").unwrap().as_f64(), Some(7.0));
    assert_eq!(second.get("count").unwrap().as_f64(), Some(6.0));
}

#[tokio::test]
async fn mutations_push_to_other_peers() {
    let root = ObjectHandle::new();
    root.set("status", "idle");
    root.set(
        "set_status",
        HostValue::function(|args| async move {
            // The setter reaches its object through the first argument, so
            // the test does not need a captured handle.
            let (Some(HostValue::Object(target)), Some(HostValue::String(status))) =
                (args.first(), args.get(1))
            else {
                return Err(Error::Application("bad arguments".to_string()));
            };
            target.set("status", status.clone());
            Ok(HostValue::Null)
        }),
    );
    sync_value(&HostValue::Object(root.clone()));
    let server = Server::builder(root).build();

    let (writer_client, _task_a) = connect(&server).await;
    let (watcher_client, _task_b) = connect(&server).await;

    let writer_root = writer_client.root_object().unwrap();
    let watcher_root = watcher_client.root_object().unwrap();
    assert_eq!(watcher_root.get("status").unwrap().as_str(), Some("idle"));

    writer_root
        .call(
            "set_status",
            vec![ClientArg::from(&writer_root), ClientArg::from("ready")],
        )
        .await
        .unwrap();

    // The caller sees the change synchronously via its response bundle.
    assert_eq!(writer_root.get("status").unwrap().as_str(), Some("ready"));
    // The other peer sees it via a push.
    eventually(|| {
        watcher_root
            .get("status")
            .is_some_and(|v| v.as_str() == Some("ready"))
    })
    .await;
}

#[tokio::test]
async fn update_bursts_reach_slow_peers_in_order() {
    use objwire::protocol::LineBuffer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    let root = ObjectHandle::new();
    root.set("seq", -1.0);
    root.set(
        "bump",
        HostValue::function(|args| async move {
            let (Some(HostValue::Object(target)), Some(HostValue::Number(n))) =
                (args.first(), args.get(1))
            else {
                return Err(Error::Application("bad arguments".to_string()));
            };
            target.set("seq", *n);
            Ok(HostValue::Null)
        }),
    );
    sync_value(&HostValue::Object(root.clone()));
    let server = Server::builder(root).build();

    let (writer_client, _task_a) = connect(&server).await;

    // A raw watcher over a tiny transport buffer whose reader is slow, so
    // pushes back up in the server's writer channel instead of flowing out.
    let (mut watcher, stream) = duplex(64);
    let _task_b = {
        let server = server.clone();
        tokio::spawn(async move { server.handle_connection(stream).await })
    };
    watcher
        .write_all(b"{\"msgID\":1,\"type\":\"init\"}\n")
        .await
        .unwrap();

    let (lines_tx, mut lines_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut framing = LineBuffer::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = match watcher.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let Ok(lines) = framing.push(&buf[..n]) else {
                return;
            };
            for line in lines {
                let packet: serde_json::Value = serde_json::from_str(&line).unwrap();
                if lines_tx.send(packet).is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    });
    let init = lines_rx.recv().await.unwrap();
    assert_eq!(init["type"], "init");

    const BURST: usize = 300;
    let writer_root = writer_client.root_object().unwrap();
    for i in 0..BURST {
        writer_root
            .call(
                "bump",
                vec![ClientArg::from(&writer_root), ClientArg::from(i as f64)],
            )
            .await
            .unwrap();
    }

    // Every mutation arrives as its own push, in write order.
    let mut seen = Vec::with_capacity(BURST);
    while seen.len() < BURST {
        let packet = timeout(Duration::from_secs(10), lines_rx.recv())
            .await
            .expect("watcher starved of pushes")
            .expect("watcher stream ended early");
        assert_eq!(packet["type"], "update");
        let updates = packet["updateBundle"]["updates"].as_object().unwrap();
        let (_, update) = updates.iter().next().unwrap();
        seen.push(update["map"]["seq"]["value"].as_f64().unwrap());
    }
    for (i, value) in seen.iter().enumerate() {
        assert_eq!(*value, i as f64);
    }
}

#[tokio::test]
async fn deletions_remove_the_property_on_peers() {
    let root = ObjectHandle::new();
    root.set("flag", true);
    root.set(
        "clear_flag",
        HostValue::function(|args| async move {
            let Some(HostValue::Object(target)) = args.first() else {
                return Err(Error::Application("bad arguments".to_string()));
            };
            target.remove("flag");
            Ok(HostValue::Null)
        }),
    );
    sync_value(&HostValue::Object(root.clone()));
    let server = Server::builder(root).build();

    let (writer_client, _task_a) = connect(&server).await;
    let (watcher_client, _task_b) = connect(&server).await;

    let writer_root = writer_client.root_object().unwrap();
    let watcher_root = watcher_client.root_object().unwrap();
    assert_eq!(watcher_root.get("flag").unwrap().as_bool(), Some(true));

    writer_root
        .call("clear_flag", vec![ClientArg::from(&writer_root)])
        .await
        .unwrap();

    assert!(writer_root.get("flag").is_none());
    eventually(|| watcher_root.get("flag").is_none()).await;
}

#[tokio::test]
async fn function_mirrors_invoke_directly() {
    let root = ObjectHandle::new();
    root.set(
        "double",
        HostValue::function(|args| async move {
            match args.first() {
                Some(HostValue::Number(n)) => Ok(HostValue::Number(n * 2.0)),
                _ => Err(Error::Application("expected a number".to_string())),
            }
        }),
    );
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    let root = client.root_object().unwrap();
    let double = root.get("double").unwrap();
    let double = double.as_remote().unwrap();
    assert_eq!(double.kind(), RemoteKind::Function);

    let result = double.invoke(vec![ClientArg::from(21.0)]).await.unwrap();
    assert_eq!(result.as_f64(), Some(42.0));
}

#[tokio::test]
async fn server_side_mutations_flush_to_peers() {
    let root = ObjectHandle::new();
    root.set("tick", 0.0);
    sync_value(&HostValue::Object(root.clone()));
    let server = Server::builder(root.clone()).build();

    let (client, _task) = connect(&server).await;
    let mirror = client.root_object().unwrap();
    assert_eq!(mirror.get("tick").unwrap().as_f64(), Some(0.0));

    // No request is in flight; the embedder mutates and flushes.
    root.set("tick", 1.0);
    server.flush_updates().await;

    eventually(|| {
        mirror
            .get("tick")
            .is_some_and(|v| v.as_f64() == Some(1.0))
    })
    .await;
}

#[tokio::test]
async fn untracked_returns_arrive_inline() {
    let root = ObjectHandle::new();
    root.set(
        "snapshot",
        HostValue::function(|_args| async move {
            let data = ObjectHandle::new();
            data.set("inline", true);
            data.set_tracked(false);
            Ok(HostValue::Object(data))
        }),
    );
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    let root = client.root_object().unwrap();
    let result = root.call("snapshot", vec![]).await.unwrap();
    let ClientValue::Data(json) = result else {
        panic!("expected inline data, got a mirror");
    };
    assert_eq!(json["inline"], true);
}

#[tokio::test]
async fn remote_failures_surface_as_errors() {
    let root = ObjectHandle::new();
    root.set(
        "refuse",
        HostValue::function(|_args| async move {
            Err(Error::Application("denied".to_string()))
        }),
    );
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    let root = client.root_object().unwrap();

    let result = root.call("refuse", vec![]).await;
    let Err(Error::Remote(message)) = result else {
        panic!("expected a remote error, got {result:?}");
    };
    assert!(message.contains("denied"));

    // A failed call does not poison the connection.
    let result = root.call("missing", vec![]).await;
    assert!(matches!(result, Err(Error::Remote(_))));
}

#[tokio::test]
async fn disconnect_releases_peer_held_objects() {
    let root = ObjectHandle::new();
    root.set(
        "make",
        HostValue::function(|_args| async move {
            let fresh = ObjectHandle::new();
            fresh.set("tag", "transient");
            Ok(HostValue::Object(fresh))
        }),
    );
    let server = Server::builder(root).build();
    let baseline = server.tracker().tracked_count();

    let (client, task) = connect(&server).await;
    let root = client.root_object().unwrap();
    let made = root.call("make", vec![]).await.unwrap();
    assert!(made.as_remote().is_some());
    assert!(server.tracker().tracked_count() > baseline);

    drop(made);
    drop(root);
    drop(client);
    let result = task.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(server.tracker().tracked_count(), baseline);
}

#[tokio::test]
async fn arrays_mirror_elements_and_named_props() {
    use objwire::ArrayHandle;

    let list = ArrayHandle::from_values(vec![
        HostValue::Number(1.0),
        HostValue::String("two".into()),
    ]);
    list.set("label", "numbers");
    let root = ObjectHandle::new();
    root.set("list", list);
    let server = Server::builder(root).build();

    let (client, _task) = connect(&server).await;
    let root = client.root_object().unwrap();
    let list = root.get("list").unwrap();
    let list = list.as_remote().unwrap();
    assert_eq!(list.kind(), RemoteKind::Array);
    assert_eq!(list.len(), 2);
    assert_eq!(list.element(0).unwrap().as_f64(), Some(1.0));
    assert_eq!(list.element(1).unwrap().as_str(), Some("two"));
    assert_eq!(list.get("label").unwrap().as_str(), Some("numbers"));
}
