//! Two request sessions served by one thread
//!
//! Each "request" gets its own session, so the `cart` store of one request
//! never sees the other's items even though both use the same definition.
//! The async checkout actions are interleaved on one executor and each
//! resolves the `pricing` store of its own session.
//!
//! Run with `RUST_LOG=cairn_core=debug` to see store lifecycle events.

use cairn_core::{
    define_store, plugin_fn, value_map, ActionError, Extension, MutationKind, RuntimeConfig,
    Session, StoreDefinition, Value,
};
use futures::executor::block_on;
use futures::future::join;
use tracing::info;

const CONFIG: &str = "(missing_session: Warn, trace_mutations: true)";

fn pricing() -> StoreDefinition {
    define_store("pricing")
        .state(|| value_map! { "unit_cents" => 250, "currency" => "EUR" })
        .build()
}

fn cart(pricing: StoreDefinition) -> StoreDefinition {
    define_store("cart")
        .state(|| value_map! { "items" => Vec::<Value>::new(), "paid" => false })
        .getter("count", |cart| {
            Ok(Value::Int(cart.get("items").as_list().map_or(0, |l| l.len() as i64)))
        })
        .getter("total_cents", move |cart| {
            let unit = pricing.use_store()?.get("unit_cents").as_int().unwrap_or(0);
            Ok(Value::Int(cart.getter("count")?.as_int().unwrap_or(0) * unit))
        })
        .action("add", |cart, args| {
            let item = args.first().cloned().unwrap_or_default();
            cart.update("items", |items| {
                let mut list = items.as_list().map(<[Value]>::to_vec).unwrap_or_default();
                list.push(item);
                Value::List(list)
            })?;
            cart.getter("count").map_err(ActionError::from)
        })
        .async_action("checkout", |cart, _| async move {
            let total = cart.getter("total_cents")?;
            if total.as_int().unwrap_or(0) == 0 {
                return Err(ActionError::new("cart is empty"));
            }
            cart.patch(value_map! { "paid" => true });
            Ok(total)
        })
        .build()
}

fn open_request(name: &str) -> Session {
    let session = cairn_core::open_session();
    let label = name.to_string();
    session.use_plugin(plugin_fn("request-label", move |_| {
        Ok(Extension::new().with_property("request", label.as_str()))
    }));
    session.attach();
    session
}

fn main() -> cairn_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    cairn_core::set_runtime_config(RuntimeConfig::from_ron(CONFIG)?);

    let pricing = pricing();
    let cart = cart(pricing.clone());

    let alice = open_request("alice");
    let bob = open_request("bob");
    pricing.use_store_in(&bob)?.set("unit_cents", 199)?;

    let alice_cart = cart.use_store_in(&alice)?;
    let bob_cart = cart.use_store_in(&bob)?;
    for store in [&alice_cart, &bob_cart] {
        let request = store.property("request").unwrap_or_default();
        store.subscribe(move |mutation, state| {
            if mutation.kind != MutationKind::Direct {
                info!(%request, kind = %mutation.kind, paid = %state.get("paid").cloned().unwrap_or_default(), "cart changed");
            }
        });
        store.on_action(|ctx| {
            let name = ctx.name().to_string();
            ctx.after(move |value| info!(action = %name, %value, "action finished"));
            let name = ctx.name().to_string();
            ctx.on_error(move |err| info!(action = %name, %err, "action failed"));
        });
    }

    alice_cart.call("add", vec!["book".into()])?;
    alice_cart.call("add", vec!["pen".into()])?;
    bob_cart.call("add", vec!["lamp".into()])?;

    let alice_checkout = alice_cart.dispatch("checkout", vec![])?.settle();
    let bob_checkout = bob_cart.dispatch("checkout", vec![])?.settle();
    let (alice_total, bob_total) = block_on(join(alice_checkout, bob_checkout));
    info!(alice = ?alice_total, bob = ?bob_total, "checkouts settled");

    // hydrate a fresh session from alice's serialized state
    let snapshot = alice.root_state();
    let replay = open_request("alice-replay");
    replay.set_state_provider(move || snapshot.clone());
    let replayed = cart.use_store_in(&replay)?;
    info!(
        items = %replayed.get("items"),
        paid = %replayed.get("paid"),
        "replayed cart"
    );

    for session in [alice, bob, replay] {
        info!(session = %session.id(), stores = ?session.store_ids(), "closing");
        cairn_core::close_session(&session);
    }
    Ok(())
}
