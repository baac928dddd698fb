use crate::input::AnalysisConfig;
use log::info;
use std::time::Duration;

pub fn show_greeting(stage: &str, config_path: &str) {
    info!("=== Offshore suitable-conditions climatology: {} ===", stage);
    info!("Loading configuration from: {}", config_path);
}

pub fn config_echo(config: &AnalysisConfig) {
    info!("Configuration:");
    info!("  Years: {}-{}", config.years[0], config.years[1]);
    info!("  Exceedance files: {}", config.opa_path);
    info!("  Artifacts: {}", config.data_path);
    info!("  Quantiles: {:?}", config.quantiles);
    info!("  Windows (days): {:?}", config.windows);
    info!(
        "  Workers: {}",
        if config.use_dask {
            format!(
                "{} x {} threads, tiles of {}x{}",
                config.dask.n_workers, config.dask.n_threads, config.dask.chunk_lat, config.dask.chunk_lon
            )
        } else {
            "single thread".to_string()
        }
    );
    info!("  Combinations: {}", config.threshold_combination.len());
    for (name, members) in &config.threshold_combination {
        info!("    {}: {}", name, members.join(" AND "));
    }
}

pub fn show_farewell_with_timing(elapsed: Duration) {
    info!("=== Completed successfully in {:.2?} ===", elapsed);
}
