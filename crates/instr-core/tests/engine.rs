//! Engine behavior against a simulated instrument.
//!
//! The simulator is a task on the far side of an in-memory duplex stream:
//! it answers commands from a scripted handler and records every command it
//! receives, so tests can assert exactly how many exchanges the engine
//! performed (caching and zero-I/O guarantees).

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use instr_core::{
    Backend, ChannelIds, Discard, Feature, InstrError, Limits, Node, ProtocolConfig, Schema, Value,
};

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// Command log shared with the simulator task.
type CommandLog = Arc<Mutex<Vec<String>>>;

fn spawn_sim(mut respond: Responder) -> (Arc<Backend>, CommandLog) {
    let (host, device) = tokio::io::duplex(1024);
    let backend = Arc::new(Backend::new(
        Box::new(device),
        ProtocolConfig::default().with_timeout_ms(200),
    ));
    let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
    let sim_log = log.clone();
    tokio::spawn(async move {
        let mut io = BufReader::new(host);
        loop {
            let mut line = String::new();
            match io.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let command = line.trim_end().to_string();
            sim_log.lock().unwrap().push(command.clone());
            if let Some(reply) = respond(&command) {
                let framed = format!("{}\n", reply);
                if io.get_mut().write_all(framed.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    });
    (backend, log)
}

fn exchange_count(log: &CommandLog) -> usize {
    log.lock().unwrap().len()
}

/// A small DC-source-like schema exercising most engine paths.
fn source_schema() -> Arc<Schema> {
    Schema::builder("source")
        .feature(
            Feature::text("mode")
                .get("getm")
                .set("setm {value}")
                .mapping([("Ground", "gnd"), ("Step", "stp")]),
        )
        .feature(
            Feature::float("range")
                .get("R?")
                .set("R {value}")
                .limits(Limits::discrete([1.0, 10.0]))
                .discard([Discard::limits("level"), Discard::cache("level")]),
        )
        .feature(
            Feature::float("level")
                .get("L?")
                .set("L {value:E}")
                .limits_resolver("level"),
        )
        .feature(Feature::bool("output").get("OUT?").set("OUT {value}"))
        .feature(
            Feature::float("guarded")
                .set("G {value}")
                .limits(Limits::float(0.0, 1.0))
                .check("output disabled", |node, _| {
                    Box::pin(async move { Ok(!node.get_bool("output").await?) })
                }),
        )
        .feature(Feature::text("ident").get("ID?"))
        .feature(Feature::bool("locked").get("LCK?"))
        .limits_resolver("level", |node| {
            Box::pin(async move {
                let range = node.get_f64("range").await?;
                Ok(Limits::float_step(-1.2 * range, 1.2 * range, 1e-3))
            })
        })
        .build()
        .unwrap()
}

fn source_responder() -> Responder {
    let mut range = "1E0".to_string();
    Box::new(move |command| match command {
        "getm" => Some("stp".to_string()),
        "R?" => Some(range.clone()),
        "L?" => Some("0.5".to_string()),
        "OUT?" => Some("1".to_string()),
        "ID?" => Some("SRC-1".to_string()),
        "LCK?" => Some("0".to_string()),
        cmd if cmd.starts_with("R ") => {
            range = format!("{}E0", &cmd[2..]);
            None
        }
        cmd if cmd.starts_with("setm ") || cmd.starts_with("L ") || cmd.starts_with("G ") => None,
        other => panic!("simulator got unexpected command {:?}", other),
    })
}

#[tokio::test]
async fn get_after_set_hits_the_cache() {
    let (backend, log) = spawn_sim(source_responder());
    let node = Node::root(source_schema(), backend);

    node.set("mode", "Step").await.unwrap();
    assert_eq!(log.lock().unwrap().as_slice(), ["setm stp"]);

    let mode = node.get("mode").await.unwrap();
    assert_eq!(mode, Value::Str("Step".into()));
    // No further exchange: the set primed the cache.
    assert_eq!(exchange_count(&log), 1);
}

#[tokio::test]
async fn get_caches_and_repeats_from_cache() {
    let (backend, log) = spawn_sim(source_responder());
    let node = Node::root(source_schema(), backend);

    assert_eq!(node.get_string("ident").await.unwrap(), "SRC-1");
    assert_eq!(node.get_string("ident").await.unwrap(), "SRC-1");
    assert_eq!(exchange_count(&log), 1);
}

#[tokio::test]
async fn uncached_root_always_exchanges() {
    let (backend, log) = spawn_sim(source_responder());
    let node = Node::root_uncached(source_schema(), backend);

    node.get("ident").await.unwrap();
    node.get("ident").await.unwrap();
    assert_eq!(exchange_count(&log), 2);
}

#[tokio::test]
async fn discard_edges_force_fresh_exchange_and_limits_recompute() {
    let (backend, log) = spawn_sim(source_responder());
    let node = Node::root(source_schema(), backend);

    // Resolve the limits once: reads range (1 exchange), caches both.
    let limits = node.resolved_limits("level").await.unwrap().unwrap();
    assert_eq!(limits, Limits::float_step(-1.2, 1.2, 1e-3));
    node.get("level").await.unwrap();
    let before = exchange_count(&log);

    // Setting the range invalidates level's cache AND its resolved limits.
    node.set("range", 10.0).await.unwrap();

    let limits = node.resolved_limits("level").await.unwrap().unwrap();
    assert_eq!(limits, Limits::float_step(-12.0, 12.0, 1e-3));
    node.get("level").await.unwrap();
    // range set + level re-read; the resolver reads range from its own
    // just-updated cache entry.
    assert_eq!(exchange_count(&log), before + 2);
}

#[tokio::test]
async fn checks_fail_before_limits_with_zero_io() {
    let (backend, log) = spawn_sim(source_responder());
    let node = Node::root(source_schema(), backend);

    // The check consults the cached sibling, so no exchange happens at all.
    node.prime_cache("output", Value::Bool(true));
    // Value is also out of range; the check must still fail first.
    let err = node.set("guarded", 5.0).await.unwrap_err();
    assert!(matches!(err, InstrError::Precondition { .. }));
    assert!(err.to_string().contains("output disabled"));
    assert_eq!(exchange_count(&log), 0);
}

#[tokio::test]
async fn out_of_range_set_performs_no_io() {
    let (backend, log) = spawn_sim(source_responder());
    let node = Node::root(source_schema(), backend);

    node.prime_cache("output", Value::Bool(false));
    let err = node.set("guarded", 5.0).await.unwrap_err();
    assert!(matches!(err, InstrError::OutOfRange { .. }));
    assert_eq!(exchange_count(&log), 0);
}

#[tokio::test]
async fn unsupported_operations_are_reported() {
    let (backend, _log) = spawn_sim(source_responder());
    let node = Node::root(source_schema(), backend);

    let err = node.set("ident", "X").await.unwrap_err();
    assert!(matches!(err, InstrError::UnsupportedOperation { .. }));
    let err = node.get("guarded").await.unwrap_err();
    assert!(matches!(err, InstrError::UnsupportedOperation { .. }));
}

#[tokio::test]
async fn failed_operation_check_drops_the_cache_entry() {
    let schema = Schema::builder("checked")
        .feature(Feature::float("level").get("L?").set("L {value}"))
        .operation_check(|node, outcome| {
            Box::pin(async move {
                let status = node.backend().query("ERR?").await?;
                if status == "0" {
                    Ok(None)
                } else {
                    Ok(Some(format!("{} (while setting {})", status, outcome.feature)))
                }
            })
        })
        .build()
        .unwrap();

    let mut fail = false;
    let (backend, _log) = spawn_sim(Box::new(move |command| match command {
        "L?" => Some("0.25".to_string()),
        "ERR?" => {
            let reply = if fail { "-113,\"boom\"" } else { "0" };
            fail = true;
            Some(reply.to_string())
        }
        _ => None,
    }));
    let node = Node::root(schema, backend);

    // First set passes its operation check and caches.
    node.set("level", 1.0).await.unwrap();
    assert_eq!(node.cached("level"), Some(Value::Float(1.0)));

    // Second set fails it: DeviceError with the device message, cache gone.
    let err = node.set("level", 2.0).await.unwrap_err();
    match err {
        InstrError::Device { message, .. } => assert!(message.contains("-113")),
        other => panic!("expected DeviceError, got {other}"),
    }
    assert_eq!(node.cached("level"), None);

    // The next get goes back to the wire.
    assert_eq!(node.get("level").await.unwrap(), Value::Float(0.25));
}

#[tokio::test]
async fn conditional_templates_follow_container_state() {
    let schema = Schema::builder("trig")
        .feature(Feature::text("trigger_mode").set("TRIG {value}"))
        .feature(
            Feature::float("level")
                .get_conditional("level_get")
                .set_conditional("level_set"),
        )
        .template_resolver("level_get", |node| {
            Box::pin(async move {
                Ok(match node.cached("trigger_mode") {
                    Some(Value::Str(mode)) if mode == "enabled" => "L:TRIG?".to_string(),
                    _ => "L?".to_string(),
                })
            })
        })
        .template_resolver("level_set", |node| {
            Box::pin(async move {
                Ok(match node.cached("trigger_mode") {
                    Some(Value::Str(mode)) if mode == "enabled" => "L:TRIG {value}".to_string(),
                    _ => "L {value}".to_string(),
                })
            })
        })
        .build()
        .unwrap();

    let (backend, log) = spawn_sim(Box::new(|command| match command {
        "L?" => Some("1".to_string()),
        "L:TRIG?" => Some("2".to_string()),
        _ => None,
    }));
    let node = Node::root(schema, backend);

    assert_eq!(node.get("level").await.unwrap(), Value::Float(1.0));
    node.set("trigger_mode", "enabled").await.unwrap();
    node.clear_cache_of(&["level"]);
    assert_eq!(node.get("level").await.unwrap(), Value::Float(2.0));
    node.set("level", 3.0).await.unwrap();
    assert!(log.lock().unwrap().contains(&"L:TRIG 3".to_string()));
}

#[tokio::test]
async fn computed_getter_can_prime_siblings() {
    let schema = Schema::builder("idn")
        .feature(Feature::text("manufacturer").computed("idn_field"))
        .feature(Feature::text("model").computed("idn_field_model"))
        .value_resolver("idn_field", |node| {
            Box::pin(async move {
                let idn = node.backend().query("*IDN?").await?;
                let mut fields = idn.split(',').map(str::trim);
                let manufacturer = fields.next().unwrap_or_default().to_string();
                let model = fields.next().unwrap_or_default().to_string();
                node.prime_cache("model", Value::Str(model));
                Ok(Value::Str(manufacturer))
            })
        })
        .value_resolver("idn_field_model", |node| {
            Box::pin(async move {
                let idn = node.backend().query("*IDN?").await?;
                let model = idn.split(',').nth(1).unwrap_or_default().trim().to_string();
                Ok(Value::Str(model))
            })
        })
        .build()
        .unwrap();

    let (backend, log) = spawn_sim(Box::new(|command| match command {
        "*IDN?" => Some("YOKOGAWA,GS200,91W434594,1.05".to_string()),
        _ => None,
    }));
    let node = Node::root(schema, backend);

    assert_eq!(node.get_string("manufacturer").await.unwrap(), "YOKOGAWA");
    // One *IDN? primed both fields.
    assert_eq!(node.get_string("model").await.unwrap(), "GS200");
    assert_eq!(exchange_count(&log), 1);
}

#[tokio::test]
async fn channels_memoize_instances_and_reject_unknown_ids() {
    let axis = Schema::builder("axis")
        .feature(Feature::float("position").get("POS? {ch_id}").set("POS {ch_id} {value}"))
        .build()
        .unwrap();
    let schema = Schema::builder("rack")
        .channel("axis", ChannelIds::list([1, 2]), axis)
        .build()
        .unwrap();

    let (backend, log) = spawn_sim(Box::new(|command| match command {
        "POS? 1" => Some("10".to_string()),
        "POS? 2" => Some("20".to_string()),
        _ => None,
    }));
    let node = Node::root(schema, backend);

    let err = node.channel("axis", 3).await.unwrap_err();
    assert!(matches!(err, InstrError::UnknownChannel { .. }));

    let first = node.channel("axis", 1).await.unwrap();
    assert_eq!(first.get("position").await.unwrap(), Value::Float(10.0));

    // Same instance on re-index: its cache persists.
    let again = node.channel("axis", 1).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(again.get("position").await.unwrap(), Value::Float(10.0));
    assert_eq!(exchange_count(&log), 1);

    let second = node.channel("axis", 2).await.unwrap();
    assert_eq!(second.get("position").await.unwrap(), Value::Float(20.0));
}

#[tokio::test]
async fn discovery_runs_once_per_parent() {
    let card = Schema::builder("card")
        .feature(Feature::float("voltage").get("V? {ch_id}"))
        .build()
        .unwrap();
    let schema = Schema::builder("chassis")
        .channel("card", ChannelIds::resolver("probe"), card)
        .discovery_resolver("probe", |node| {
            Box::pin(async move {
                let listing = node.backend().query("LIST?").await?;
                Ok(listing.split(',').map(str::to_string).collect())
            })
        })
        .build()
        .unwrap();

    let (backend, log) = spawn_sim(Box::new(|command| match command {
        "LIST?" => Some("1,5".to_string()),
        "V? 5" => Some("0.7".to_string()),
        _ => None,
    }));
    let node = Node::root(schema, backend);

    assert_eq!(node.channel_ids("card").await.unwrap(), vec!["1", "5"]);
    let card = node.channel("card", 5).await.unwrap();
    assert_eq!(card.get("voltage").await.unwrap(), Value::Float(0.7));

    // Unknown id afterwards costs no further exchange: discovery is cached.
    let before = exchange_count(&log);
    let err = node.channel("card", 9).await.unwrap_err();
    assert!(matches!(err, InstrError::UnknownChannel { .. }));
    assert_eq!(exchange_count(&log), before);
    assert_eq!(
        log.lock()
            .unwrap()
            .iter()
            .filter(|cmd| cmd.as_str() == "LIST?")
            .count(),
        1
    );
}

#[tokio::test]
async fn subsystems_share_backend_and_may_override_address() {
    let inner = Schema::builder("trigger")
        .feature(Feature::float("delay").get("DEL? {ch_id}"))
        .build()
        .unwrap();
    let schema = Schema::builder("dev")
        .subsystem_at("trigger", inner.clone(), "T")
        .build()
        .unwrap();

    let (backend, _log) = spawn_sim(Box::new(|command| match command {
        "DEL? T" => Some("1.5".to_string()),
        _ => None,
    }));
    let node = Node::root(schema, backend);
    let trigger = node.subsystem("trigger").unwrap();
    assert!(Arc::ptr_eq(trigger.backend(), node.backend()));
    assert_eq!(trigger.get("delay").await.unwrap(), Value::Float(1.5));

    // One instance per parent.
    let again = node.subsystem("trigger").unwrap();
    assert!(Arc::ptr_eq(&trigger, &again));
}

#[tokio::test]
async fn actions_check_then_convert_units() {
    let schema = Schema::builder("stepper")
        .feature(Feature::text("mode").set("MODE {value}"))
        .action(
            instr_core::Action::new("ramp", |node, args| {
                Box::pin(async move {
                    let level = args[0].as_f64().unwrap_or_default();
                    node.backend().write(&format!("RAMP {}", level)).await?;
                    Ok(Value::Float(level))
                })
            })
            .check("mode is Step", |node, _args| {
                Box::pin(async move {
                    Ok(node.cached("mode") == Some(Value::Str("Step".into())))
                })
            })
            .arg_units([Some("V")])
            .ret_unit("V"),
        )
        .build()
        .unwrap();

    let (backend, log) = spawn_sim(Box::new(|_| None));
    let node = Node::root(schema, backend);

    // Check fails fast: zero I/O.
    let err = node.invoke("ramp", vec![Value::Float(1.0)]).await.unwrap_err();
    assert!(matches!(err, InstrError::Precondition { .. }));
    assert_eq!(exchange_count(&log), 0);

    node.set("mode", "Step").await.unwrap();
    // Quantity argument is normalized to the declared wire unit.
    let result = node
        .invoke("ramp", vec![Value::quantity(500.0, "mV")])
        .await
        .unwrap();
    assert_eq!(result, Value::quantity(0.5, "V"));
    assert!(log.lock().unwrap().contains(&"RAMP 0.5".to_string()));
}

#[tokio::test]
async fn cyclic_discard_declarations_fail_at_build_time() {
    let result = Schema::builder("cyclic")
        .feature(Feature::float("a").set("A {value}").discard([Discard::cache("b")]))
        .feature(Feature::float("b").set("B {value}").discard([Discard::cache("a")]))
        .build();
    assert!(matches!(result, Err(InstrError::Config(_))));
}

#[tokio::test]
async fn sentinel_error_response_is_a_device_error() {
    let schema = Schema::builder("anc")
        .feature(
            Feature::text("mode")
                .get("getm {ch_id}")
                .set("setm {ch_id} {value}")
                .sentinel("OK", "ERROR"),
        )
        .build()
        .unwrap();

    let (backend, _log) = spawn_sim(Box::new(|command| match command {
        "getm 1" => Some("stp\nOK".to_string()),
        cmd if cmd.starts_with("setm") => Some("Wrong axis type\nERROR".to_string()),
        _ => None,
    }));
    // Build a channel-less node with an address by nesting one level.
    let rack = Schema::builder("rack")
        .channel(
            "mod",
            ChannelIds::list([1]),
            schema,
        )
        .build()
        .unwrap();
    let node = Node::root(rack, backend);
    let module = node.channel("mod", 1).await.unwrap();

    assert_eq!(module.get("mode").await.unwrap(), Value::Str("stp".into()));
    let err = module.set("mode", "gnd").await.unwrap_err();
    match err {
        InstrError::Device { message, .. } => assert_eq!(message, "Wrong axis type"),
        other => panic!("expected DeviceError, got {other}"),
    }
}
