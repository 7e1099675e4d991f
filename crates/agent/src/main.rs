use std::sync::{Arc, RwLock};

use metrics_exporter_prometheus::PrometheusBuilder;

use harvest_agent::api::ApiClient;
use harvest_agent::config;
use harvest_agent::heartbeat;
use harvest_agent::plugins;
use harvest_agent::queue::{JobQueue, JobQueueConfig};
use harvest_agent::routes::{self, AppState};
use harvest_agent::silos::SiloRegistry;

#[tokio::main]
async fn main() {
    // Load configuration — fail loudly on misconfiguration.
    let agent_config = match config::load_configuration() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config::init_logging(&agent_config.agent.logging) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    tracing::info!("Harvest agent starting");

    // Install Prometheus metrics recorder.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    // Coordinator client.
    let api = match ApiClient::new(&agent_config.api) {
        Ok(api) => api,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build the coordinator client");
            std::process::exit(1);
        }
    };

    // Retrieve the silo directory. The node cannot operate without it.
    let silos_response = api.get("silos/get_all").await;
    if silos_response.status_code != 200 {
        tracing::error!(
            status_code = silos_response.status_code,
            reason = %silos_response.reason,
            url = %silos_response.url,
            "Could not retrieve silos from the coordinator, exiting"
        );
        std::process::exit(1);
    }

    let silos = match SiloRegistry::from_response(&silos_response) {
        Ok(silos) => Arc::new(silos),
        Err(e) => {
            tracing::error!(error = %e, "Silo directory is unusable, exiting");
            std::process::exit(1);
        }
    };

    // Install plugins and populate the template registry.
    let installed_plugins = plugins::install(&agent_config.plugins);
    let registry = Arc::new(RwLock::new(plugins::populate(&installed_plugins)));

    let node_name = config::node_name(&agent_config);
    let agent_config = Arc::new(agent_config);

    let queue = Arc::new(JobQueue::new(
        JobQueueConfig::from_agent_config(&agent_config, node_name.clone()),
        Arc::clone(&silos),
        Arc::clone(&registry),
    ));

    if agent_config.agent.tasks.auto_start {
        let outcome = queue.start();
        tracing::info!(success = outcome.success, message = %outcome.message, "Queue auto-start");
    }

    let _heartbeat = heartbeat::spawn_heartbeat(
        Arc::clone(&agent_config),
        Arc::clone(&silos),
        Arc::clone(&registry),
        Arc::clone(&queue),
        node_name,
    );

    if agent_config.agent.connection.pem.is_some() {
        // TLS termination is fronted by infrastructure; the configured cert
        // is carried for the coordinator's inventory only.
        tracing::warn!("agent.connection.pem is set; the control surface itself serves plain HTTP");
    }

    let state = Arc::new(AppState {
        config: Arc::clone(&agent_config),
        queue,
        registry,
        plugins: installed_plugins,
        metrics_handle,
    });

    let app = routes::router(state);

    let bind = format!(
        "{}:{}",
        agent_config.agent.connection.host, agent_config.agent.connection.port
    );

    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(bind = %bind, error = %e, "Failed to bind the control surface");
            std::process::exit(1);
        }
    };

    tracing::info!(bind = %bind, "Harvest agent listening");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "HTTP server error");
        std::process::exit(1);
    }

    tracing::warn!("Harvest agent stopped");
}
