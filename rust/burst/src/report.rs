//! Rendering a run's results to CSV files and SVG line charts.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::{AggregatedSeries, BurstConfig, Error};

/// One CSV row:  the number of operations in one second.
#[derive(Debug, serde::Serialize)]
struct Record<N: serde::Serialize> {
    interval_sec: usize,
    num_actions: N,
}

/// Write one `(interval_sec, num_actions)` row per bucket to `path`, creating parent directories.
pub fn write_csv<N: serde::Serialize + Copy>(path: &Path, series: &[N]) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!("writing csv file... ({})", path.display());
    let mut wtr = csv::Writer::from_path(path)?;
    for (interval_sec, num_actions) in series.iter().enumerate() {
        wtr.serialize(Record {
            interval_sec,
            num_actions: *num_actions,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/////////////////////////////////////////////// Plot ///////////////////////////////////////////////

const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 480.0;
const MARGIN_LEFT: f64 = 80.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_TOP: f64 = 70.0;
const MARGIN_BOTTOM: f64 = 60.0;
const Y_TICKS: usize = 5;

/// A single-series line chart.
#[derive(Clone, Debug)]
pub struct LinePlot {
    pub title: String,
    pub subtitle: String,
    pub x_label: String,
    pub y_label: String,
    pub legend: String,
    pub values: Vec<f64>,
}

impl LinePlot {
    /// The chart for one of a run's series, titled and labelled after the run.
    pub fn for_run(config: &BurstConfig, legend: &str, values: Vec<f64>) -> Self {
        let mode = config.mode();
        LinePlot {
            title: format!("Couchdb {} benchmark", mode.verb()),
            subtitle: format!(
                "{}{} {}sec {}bytes/msg",
                config.worker_count(),
                mode.actors(),
                config.burst_duration_seconds(),
                config.payload_size_bytes()
            ),
            x_label: "time (s)".to_string(),
            y_label: format!("number of {}", mode.actions()),
            legend: legend.to_string(),
            values,
        }
    }

    /// Render the chart as a standalone SVG document.
    pub fn to_svg(&self) -> String {
        let plot_w = WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
        let plot_h = HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
        let y_max = nice_ceiling(self.values.iter().copied().fold(0.0, f64::max));
        let x_max = self.values.len().saturating_sub(1).max(1) as f64;
        let px = |x: f64| MARGIN_LEFT + plot_w * x / x_max;
        let py = |y: f64| MARGIN_TOP + plot_h * (1.0 - y / y_max);

        let mut svg = String::new();
        // NOTE:  Writing to a String cannot fail, so the fmt::Results below are discarded.
        let _ = writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}" font-family="sans-serif">"#
        );
        let _ = writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#);
        let _ = writeln!(
            svg,
            r#"<text x="{}" y="28" text-anchor="middle" font-size="16">{}</text>"#,
            WIDTH / 2.0,
            escape(&self.title)
        );
        let _ = writeln!(
            svg,
            r#"<text x="{}" y="50" text-anchor="middle" font-size="13">{}</text>"#,
            WIDTH / 2.0,
            escape(&self.subtitle)
        );

        // Grid and ticks.
        for i in 0..self.values.len().max(2) {
            let x = px(i as f64);
            let _ = writeln!(
                svg,
                r##"<line x1="{x:.1}" y1="{:.1}" x2="{x:.1}" y2="{:.1}" stroke="#dddddd"/>"##,
                MARGIN_TOP,
                MARGIN_TOP + plot_h
            );
            let _ = writeln!(
                svg,
                r#"<text x="{x:.1}" y="{:.1}" text-anchor="middle" font-size="11">{i}</text>"#,
                MARGIN_TOP + plot_h + 16.0
            );
        }
        for i in 0..=Y_TICKS {
            let value = y_max * i as f64 / Y_TICKS as f64;
            let y = py(value);
            let _ = writeln!(
                svg,
                r##"<line x1="{MARGIN_LEFT:.1}" y1="{y:.1}" x2="{:.1}" y2="{y:.1}" stroke="#dddddd"/>"##,
                MARGIN_LEFT + plot_w
            );
            let _ = writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="end" font-size="11">{}</text>"#,
                MARGIN_LEFT - 6.0,
                y + 4.0,
                format_tick(value)
            );
        }
        let _ = writeln!(
            svg,
            r#"<rect x="{MARGIN_LEFT:.1}" y="{MARGIN_TOP:.1}" width="{plot_w:.1}" height="{plot_h:.1}" fill="none" stroke="black"/>"#
        );

        // Axis labels.
        let _ = writeln!(
            svg,
            r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-size="13">{}</text>"#,
            MARGIN_LEFT + plot_w / 2.0,
            HEIGHT - 16.0,
            escape(&self.x_label)
        );
        let _ = writeln!(
            svg,
            r#"<text x="20" y="{y:.1}" text-anchor="middle" font-size="13" transform="rotate(-90 20 {y:.1})">{}</text>"#,
            escape(&self.y_label),
            y = MARGIN_TOP + plot_h / 2.0
        );

        // The series.
        let points = self
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{:.1},{:.1}", px(i as f64), py(*v)))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(
            svg,
            r##"<polyline points="{points}" fill="none" stroke="#1f77b4" stroke-width="2"/>"##
        );

        // Legend.
        let lx = MARGIN_LEFT + plot_w - 150.0;
        let ly = MARGIN_TOP + 12.0;
        let _ = writeln!(
            svg,
            r##"<rect x="{:.1}" y="{:.1}" width="145" height="22" fill="white" stroke="#999999"/>"##,
            lx - 5.0,
            ly - 12.0
        );
        let _ = writeln!(
            svg,
            r##"<line x1="{lx:.1}" y1="{ly:.1}" x2="{:.1}" y2="{ly:.1}" stroke="#1f77b4" stroke-width="2"/>"##,
            lx + 20.0
        );
        let _ = writeln!(
            svg,
            r#"<text x="{:.1}" y="{:.1}" font-size="11">{}</text>"#,
            lx + 26.0,
            ly + 4.0,
            escape(&self.legend)
        );
        svg.push_str("</svg>\n");
        svg
    }

    /// Write the chart to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!("saving plotted graph... ({})", path.display());
        std::fs::write(path, self.to_svg())?;
        Ok(())
    }
}

/// Round up to 1, 2, 2.5, or 5 times a power of ten so the y axis ticks land on round numbers.
fn nice_ceiling(max: f64) -> f64 {
    if max <= 0.0 {
        return 1.0;
    }
    let magnitude = 10f64.powf(max.log10().floor());
    for step in [1.0, 2.0, 2.5, 5.0, 10.0] {
        if step * magnitude >= max {
            return step * magnitude;
        }
    }
    10.0 * magnitude
}

fn format_tick(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as u64)
    } else {
        format!("{:.1}", value)
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

////////////////////////////////////////////// Outputs /////////////////////////////////////////////

/// The files written for one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outputs {
    pub average_csv: PathBuf,
    pub sum_csv: PathBuf,
    pub average_plot: PathBuf,
    pub sum_plot: PathBuf,
}

impl Outputs {
    /// The paths for a run, named after its parameters.
    pub fn for_run(config: &BurstConfig, csv_dir: &Path, plots_dir: &Path) -> Self {
        let stem = config.file_stem();
        Outputs {
            average_csv: csv_dir.join(format!("{stem}_average.csv")),
            sum_csv: csv_dir.join(format!("{stem}_sum.csv")),
            average_plot: plots_dir.join(format!("{stem}_average.svg")),
            sum_plot: plots_dir.join(format!("{stem}_sum.svg")),
        }
    }
}

/// Log a per-worker breakdown of the run.
pub fn log_summary(config: &BurstConfig, series: &AggregatedSeries) {
    for (worker, buckets) in series.per_worker.iter().enumerate() {
        tracing::info!(
            worker,
            sum = buckets.iter().sum::<u64>(),
            "{:?}",
            buckets
        );
    }
    tracing::info!(
        "total {}: {}",
        config.mode().actions(),
        series.total()
    );
}

/// Write both CSV files and both charts for a run.
pub fn render(
    config: &BurstConfig,
    series: &AggregatedSeries,
    csv_dir: &Path,
    plots_dir: &Path,
) -> Result<Outputs, Error> {
    let outputs = Outputs::for_run(config, csv_dir, plots_dir);
    write_csv(&outputs.average_csv, &series.average)?;
    write_csv(&outputs.sum_csv, &series.sum)?;
    LinePlot::for_run(config, "average per worker", series.average.clone())
        .save(&outputs.average_plot)?;
    LinePlot::for_run(
        config,
        "total amount",
        series.sum.iter().map(|s| *s as f64).collect(),
    )
    .save(&outputs.sum_plot)?;
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{aggregate, Mode};

    fn series() -> (BurstConfig, AggregatedSeries) {
        let config = BurstConfig::new(2, 3, 5, Mode::Write).unwrap();
        let traces = vec![vec![100.1, 101.1], vec![100.2, 101.2, 102.2]];
        let series = aggregate(&traces, 100.0, config.burst_duration());
        (config, series)
    }

    #[test]
    fn csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (_, series) = series();
        let path = dir.path().join("nested").join("sum.csv");
        write_csv(&path, &series.sum).unwrap();
        assert_eq!(
            "interval_sec,num_actions\n0,2\n1,2\n2,1\n",
            std::fs::read_to_string(&path).unwrap()
        );
        let path = dir.path().join("average.csv");
        write_csv(&path, &series.average).unwrap();
        assert_eq!(
            "interval_sec,num_actions\n0,1.0\n1,1.0\n2,0.5\n",
            std::fs::read_to_string(&path).unwrap()
        );
    }

    #[test]
    fn render_names_files_after_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (config, series) = series();
        let outputs = render(
            &config,
            &series,
            &dir.path().join("csv"),
            &dir.path().join("plots"),
        )
        .unwrap();
        assert_eq!(
            dir.path().join("csv/couchdb_2writers_3sec_5bytes_sum.csv"),
            outputs.sum_csv
        );
        assert_eq!(
            dir.path().join("plots/couchdb_2writers_3sec_5bytes_average.svg"),
            outputs.average_plot
        );
        for path in [
            &outputs.average_csv,
            &outputs.sum_csv,
            &outputs.average_plot,
            &outputs.sum_plot,
        ] {
            assert!(path.exists(), "{} missing", path.display());
        }
    }

    #[test]
    fn plot_labels() {
        let config = BurstConfig::new(3, 5, 10, Mode::Read).unwrap();
        let svg = LinePlot::for_run(&config, "total amount", vec![3.0, 9.0, 4.0]).to_svg();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("Couchdb read benchmark"));
        assert!(svg.contains("3readers 5sec 10bytes/msg"));
        assert!(svg.contains("number of reads"));
        assert!(svg.contains("time (s)"));
        assert!(svg.contains("total amount"));
        assert!(svg.contains("<polyline"));
    }

    #[test]
    fn nice_ceilings() {
        assert_eq!(1.0, nice_ceiling(0.0));
        assert_eq!(1.0, nice_ceiling(1.0));
        assert_eq!(2.0, nice_ceiling(1.5));
        assert_eq!(250.0, nice_ceiling(212.0));
        assert_eq!(1000.0, nice_ceiling(999.0));
    }
}
