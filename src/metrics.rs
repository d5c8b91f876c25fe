use std::net::SocketAddr;

use log::{error, info};
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};
use warp::Filter;

pub static RELAY_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "relay_active_connections",
        "relay_active_connections",
        &["worker"]
    )
    .unwrap()
});

pub static RELAY_FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("relay_frames", "relay_frames", &["worker"]).unwrap()
});

pub static CAPTURED_PACKETS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("captured_packets", "captured_packets", &["stage"]).unwrap()
});

pub static PIPELINE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("pipeline_errors", "pipeline_errors", &["stage"]).unwrap()
});

pub static DROPPED_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("dropped_events", "dropped_events", &["worker"]).unwrap()
});

pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", err);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub async fn serve(bind_addr: SocketAddr) {
    info!("Serving metrics on {}", bind_addr);
    let route = warp::path("metrics").and(warp::get()).map(render);
    warp::serve(route).run(bind_addr).await
}
