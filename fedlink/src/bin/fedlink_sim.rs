use std::sync::Arc;
use std::time::Duration;

use fedlink::core::aggregation::IMPORTANCE;
use fedlink::core::info::TRAIN_INSTANCES;
use fedlink::core::reducer::AutoReducer;
use fedlink::core::traits::FederatedModel;
use fedlink::hooks::{AggregateCount, Terminate, VersionGate};
use fedlink::models::optim::Sgd;
use fedlink::models::simple::LinearModel;
use fedlink::runtime::tokio_runtime::TokioRuntime;
use fedlink::{
    connect, Address, ControlLoop, Edge, ExitReason, FedConfig, FedContext, LocalHub, Node, Participant,
    PolicyKind, TaskInfo, Topology,
};
use tracing_subscriber::EnvFilter;

const INPUT_DIM: usize = 4;
const SAMPLES: usize = 32;
const COORDINATOR: &str = "aggregator";

fn usage() -> ! {
    eprintln!("Usage: fedlink_sim [peers] [rounds] [average|naive|elastic]");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  RUST_LOG=debug fedlink_sim 3 5 naive");
    std::process::exit(2);
}

fn arg<T: std::str::FromStr>(args: &[String], i: usize, default: T) -> T {
    match args.get(i) {
        Some(raw) => raw.parse().unwrap_or_else(|_| usage()),
        None => default,
    }
}

/// Deterministic samples of `y = 2 x0 - x1 + 0.5 x2 + 0.1`
fn dataset(seed: u64) -> Vec<([f32; INPUT_DIM], f32)> {
    let mut state = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        (state >> 33) as f32 / (1u64 << 31) as f32 * 2.0 - 1.0
    };
    (0..SAMPLES)
        .map(|_| {
            let x = [next(), next(), next(), next()];
            (x, 2.0 * x[0] - x[1] + 0.5 * x[2] + 0.1)
        })
        .collect()
}

async fn peer(
    nick_name: String,
    seed: u64,
    rounds: i64,
    topo: Arc<Topology>,
    hub: LocalHub,
    runtime: Arc<TokioRuntime>,
    config: FedConfig,
    ctx: Arc<FedContext>,
) -> fedlink::Result<f32> {
    let mut connected = connect(&topo, &nick_name, &hub, runtime, &config, &ctx).await?;
    let pipe = connected
        .followers
        .pop()
        .ok_or_else(|| fedlink::Error::Config(format!("{nick_name} has no coordinator")))?;
    let local = LinearModel::new(INPUT_DIM, 1).with_random_init(seed);
    let mut participant = Participant::new(pipe, local.store().clone())?.with_aux_keys([IMPORTANCE]);
    let data = dataset(seed);

    let mut loss = f32::NAN;
    for round in 0..rounds {
        participant.fetch(round).await?;

        let mut model = LinearModel::new(INPUT_DIM, 1);
        *model.store_mut() = participant.model().clone();
        let mut total = 0.0;
        for (x, y) in &data {
            total += model.train_step(x, &[*y], 0.05)?;
        }
        loss = total / SAMPLES as f32;

        let store = model.store_mut();
        let ids: Vec<String> = store.parameters().keys().cloned().collect();
        for id in ids {
            let importance = store
                .get(&id)
                .map(|p| p.value.iter().map(|v| v.abs()).collect())
                .unwrap_or_default();
            store.set_state(id, IMPORTANCE, importance);
        }
        *participant.model_mut() = model.store().clone();

        participant
            .submit(
                TaskInfo::new()
                    .with(TRAIN_INSTANCES, SAMPLES as i64)
                    .with("loss", f64::from(loss)),
            )
            .await?;
        tracing::info!(%nick_name, round, loss, "local round done");
    }
    participant.leave().await;
    Ok(loss)
}

async fn simulate(peers: usize, rounds: i64, policy: PolicyKind) -> fedlink::Result<(ExitReason, Option<f64>)> {
    let config = FedConfig::builder()
        .name("fedlink_sim")
        .policy(policy)
        .transfer_deadline(Duration::from_secs(30))
        .poll_interval(Duration::from_millis(5))
        .tick_interval(Duration::from_millis(10))
        .idle_interval(Duration::from_millis(200))
        .build()?;

    let address = Address::new("local", "tcp://127.0.0.1:7700")?;
    let coordinator = Node::new(COORDINATOR, Some(address));
    let mut topo = Topology::new();
    let names: Vec<String> = (0..peers).map(|i| format!("peer-{i:02}")).collect();
    for name in &names {
        topo.add_edge(Edge::new(Node::new(name.as_str(), None), coordinator.clone())?);
    }
    tracing::debug!("topology\n{topo}");
    let topo = Arc::new(topo);

    let hub = LocalHub::new();
    let ctx = FedContext::global();
    let runtime = Arc::new(TokioRuntime::new());

    let tasks: Vec<_> = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            tokio::spawn(peer(
                name,
                i as u64 + 1,
                rounds,
                Arc::clone(&topo),
                hub.clone(),
                Arc::clone(&runtime),
                config.clone(),
                Arc::clone(&ctx),
            ))
        })
        .collect();

    let connected = connect(&topo, COORDINATOR, &hub, Arc::clone(&runtime), &config, &ctx).await?;
    let model = LinearModel::new(INPUT_DIM, 1).store().clone();
    let mut control = ControlLoop::new(connected.leaders, model, Box::new(Sgd::default()), runtime, &config)?
        .with_reducer(Box::new(AutoReducer::new().with_weight_key(TRAIN_INSTANCES)))
        .with_hook(Box::new(VersionGate))
        .with_hook(Box::new(AggregateCount::new(peers)))
        .with_hook(Box::new(Terminate::at_version(rounds)));
    let reason = control.run().await?;

    for task in tasks {
        match task.await {
            Ok(Ok(loss)) => tracing::debug!(loss, "peer finished"),
            Ok(Err(e)) => tracing::warn!(error = %e, "peer failed"),
            Err(e) => tracing::warn!(error = %e, "peer task panicked"),
        }
    }
    Ok((reason, control.reduced_info().and_then(|info| info.get_f64("loss"))))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.len() > 3 || args.iter().any(|a| a == "-h" || a == "--help") {
        usage();
    }
    let peers: usize = arg(&args, 0, 3);
    let rounds: i64 = arg(&args, 1, 5);
    let policy: PolicyKind = arg(&args, 2, PolicyKind::Average);
    if peers == 0 || rounds <= 0 {
        usage();
    }

    match simulate(peers, rounds, policy).await {
        Ok((reason, loss)) => {
            println!("{reason}");
            if let Some(loss) = loss {
                println!("mean loss of last round: {loss:.5}");
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
