use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, info};
use serde_json::json;

use fusion_ekf::measurement_log::{load_log, LoggedMeasurement};
use fusion_ekf::metrics::rmse;
use fusion_ekf::polar::polar_to_cartesian;
use fusion_ekf::{FusionConfig, FusionEkf, Observation, SensorKind, StepOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SensorFilter {
    All,
    Lidar,
    Radar,
}

impl SensorFilter {
    fn accepts(&self, kind: SensorKind) -> bool {
        match self {
            SensorFilter::All => true,
            SensorFilter::Lidar => kind == SensorKind::Lidar,
            SensorFilter::Radar => kind == SensorKind::Radar,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "fusion_ekf")]
#[command(about = "Replay a lidar/radar measurement log through the fusion EKF", long_about = None)]
struct Args {
    /// Path to measurement log (.txt or .txt.gz)
    #[arg(long)]
    input: PathBuf,

    /// Write estimates, measurements and ground truth as TSV
    #[arg(long)]
    output: Option<PathBuf>,

    /// JSON config overriding the default noise parameters
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override x acceleration noise intensity
    #[arg(long)]
    noise_ax: Option<f64>,

    /// Override y acceleration noise intensity
    #[arg(long)]
    noise_ay: Option<f64>,

    /// Which sensors to fuse
    #[arg(long, value_enum, default_value = "all")]
    sensors: SensorFilter,
}

fn build_config(args: &Args) -> Result<FusionConfig> {
    let mut config = match &args.config {
        Some(path) => FusionConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FusionConfig::default(),
    };
    if let Some(ax) = args.noise_ax {
        config.noise_ax = ax;
    }
    if let Some(ay) = args.noise_ay {
        config.noise_ay = ay;
    }
    Ok(config)
}

/// Measurement expressed in Cartesian coordinates, for side-by-side output.
fn measured_position(observation: &Observation) -> (f64, f64) {
    match observation {
        Observation::Lidar(m) => (m.px, m.py),
        Observation::Radar(m) => polar_to_cartesian(m.range, m.bearing),
    }
}

fn write_header(out: &mut impl Write) -> std::io::Result<()> {
    let columns = [
        "timestamp_us", "sensor", "est_px", "est_py", "est_vx", "est_vy", "meas_px", "meas_py",
        "gt_px", "gt_py", "gt_vx", "gt_vy",
    ];
    writeln!(out, "{}", columns.join("\t"))
}

fn write_row(
    out: &mut impl Write,
    fusion: &FusionEkf,
    m: &LoggedMeasurement,
) -> std::io::Result<()> {
    let Some(est) = fusion.estimate() else {
        return Ok(());
    };
    let (meas_px, meas_py) = measured_position(&m.observation);
    write!(
        out,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        est.timestamp_us,
        m.observation.sensor(),
        est.px,
        est.py,
        est.vx,
        est.vy,
        meas_px,
        meas_py
    )?;
    match m.ground_truth {
        Some(gt) => writeln!(out, "\t{}\t{}\t{}\t{}", gt.px, gt.py, gt.vx, gt.vy),
        None => writeln!(out, "\t\t\t\t"),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = build_config(&args)?;
    let log =
        load_log(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    info!("Loaded {} measurements from {}", log.len(), args.input.display());

    let mut writer = match &args.output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            let mut w = BufWriter::new(file);
            write_header(&mut w)?;
            Some(w)
        }
        None => None,
    };

    let mut fusion = FusionEkf::new(&config)?;
    let mut estimates = Vec::new();
    let mut truths = Vec::new();
    let mut skipped_sensor = 0usize;

    for m in log.iter() {
        if !args.sensors.accepts(m.observation.sensor()) {
            skipped_sensor += 1;
            continue;
        }
        let outcome = fusion.process_measurement(&m.observation)?;
        if let StepOutcome::PredictionOnly { reason } = &outcome {
            debug!("t={}us: prediction only ({})", m.observation.timestamp_us(), reason);
        }

        if let (Some(x), Some(gt)) = (fusion.state(), m.ground_truth) {
            estimates.push(*x);
            truths.push(gt.as_vector());
        }
        if let Some(w) = writer.as_mut() {
            write_row(w, &fusion, m)?;
        }
    }

    if let Some(mut w) = writer {
        w.flush()?;
    }

    let accuracy = rmse(&estimates, &truths).map(|e| {
        json!({ "px": e[0], "py": e[1], "vx": e[2], "vy": e[3] })
    });
    let summary = json!({
        "input": args.input.display().to_string(),
        "processed": log.len() - skipped_sensor,
        "filtered_out": skipped_sensor,
        "stats": fusion.stats(),
        "final_estimate": fusion.estimate(),
        "rmse": accuracy,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
