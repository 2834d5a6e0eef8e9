//! Metrics registry and OpenMetrics exposition.

use std::fmt;

use crate::{
    buckets::BucketPlan,
    config::EmitterConfig,
    error::ConfigurationError,
    histogram::{Exemplar, ExemplarHistogram},
};

/// Content type of the rendered exposition.
pub const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Help text of the exemplar-linked histogram.
pub const HISTOGRAM_HELP: &str = "RPC latency distributions.";

#[derive(Debug)]
struct BuildInfo {
    metric_name: String,
    version: String,
}

/// The set of metrics exposed by the emitter.
///
/// Built once at start-up and shared between the emission loop, which records into it, and the exposition server,
/// which renders it.
#[derive(Debug)]
pub struct MetricsRegistry {
    histogram: ExemplarHistogram,
    build_info: Option<BuildInfo>,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` holding the given histogram.
    pub fn new(histogram: ExemplarHistogram) -> Self {
        Self {
            histogram,
            build_info: None,
        }
    }

    /// Creates a new `MetricsRegistry` from the emitter configuration, planning the histogram's buckets.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn from_config(config: &EmitterConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let plan = BucketPlan::plan(&config.distribution, config.bucket_count)?;
        let histogram = ExemplarHistogram::new(
            config.metric_name.clone(),
            HISTOGRAM_HELP,
            config.correlation_label.clone(),
            plan,
        );

        Ok(Self::new(histogram))
    }

    /// Adds a `<prefix>_build_info` gauge carrying the given version.
    ///
    /// Characters in `prefix` that are not valid in a metric name are replaced with underscores.
    pub fn with_build_info(mut self, prefix: &str, version: &str) -> Self {
        self.build_info = Some(BuildInfo {
            metric_name: format!("{}_build_info", normalize_metric_name(prefix)),
            version: version.to_string(),
        });
        self
    }

    /// Returns the exemplar-linked histogram.
    pub fn histogram(&self) -> &ExemplarHistogram {
        &self.histogram
    }

    /// Renders all metrics in the OpenMetrics text format.
    pub fn render(&self) -> String {
        let mut payload = String::new();

        // Writing to a `String` never fails.
        let _ = self.render_into(&mut payload);
        payload
    }

    /// Renders all metrics in the OpenMetrics text format into the given writer.
    ///
    /// # Errors
    ///
    /// If the writer fails, an error is returned.
    pub fn render_into<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        self.write_histogram(w)?;

        if let Some(build_info) = &self.build_info {
            writeln!(
                w,
                "# HELP {} A metric with a constant '1' value labeled by the build version.",
                build_info.metric_name
            )?;
            writeln!(w, "# TYPE {} gauge", build_info.metric_name)?;
            write!(w, "{}{{version=\"", build_info.metric_name)?;
            write_escaped_label_value(w, &build_info.version)?;
            writeln!(w, "\"}} 1")?;
        }

        writeln!(w, "# EOF")
    }

    fn write_histogram<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        let histogram = &self.histogram;
        let name = histogram.name();
        let label = histogram.label().as_str();
        let snapshot = histogram.snapshot();

        writeln!(w, "# HELP {} {}", name, histogram.help())?;
        writeln!(w, "# TYPE {} histogram", name)?;

        for (upper_bound, count, exemplar) in snapshot.cumulative_buckets() {
            write!(w, "{}_bucket{{le=\"", name)?;
            write_float(w, upper_bound)?;
            write!(w, "\"}} {}", count)?;
            if let Some(exemplar) = exemplar {
                write_exemplar(w, label, exemplar)?;
            }
            writeln!(w)?;
        }

        write!(w, "{}_sum ", name)?;
        write_float(w, snapshot.sum())?;
        writeln!(w)?;
        writeln!(w, "{}_count {}", name, snapshot.count())
    }
}

fn write_exemplar<W: fmt::Write>(w: &mut W, label: &str, exemplar: &Exemplar) -> fmt::Result {
    write!(w, " # {{{}=\"", label)?;
    write_escaped_label_value(w, exemplar.correlation_id().as_str())?;
    write!(w, "\"}} ")?;
    write_float(w, exemplar.value())?;

    let timestamp = exemplar.timestamp();
    write!(
        w,
        " {}.{:03}",
        timestamp.timestamp(),
        timestamp.timestamp_subsec_millis()
    )
}

fn write_float<W: fmt::Write>(w: &mut W, value: f64) -> fmt::Result {
    if value.is_nan() {
        w.write_str("NaN")
    } else if value == f64::INFINITY {
        w.write_str("+Inf")
    } else if value == f64::NEG_INFINITY {
        w.write_str("-Inf")
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        // Integral values are rendered with a trailing ".0" so that they are unambiguously floats.
        write!(w, "{:.1}", value)
    } else {
        write!(w, "{}", value)
    }
}

fn write_escaped_label_value<W: fmt::Write>(w: &mut W, value: &str) -> fmt::Result {
    for c in value.chars() {
        match c {
            '\\' => w.write_str("\\\\")?,
            '"' => w.write_str("\\\"")?,
            '\n' => w.write_str("\\n")?,
            c => w.write_char(c)?,
        }
    }
    Ok(())
}

fn normalize_metric_name(name: &str) -> String {
    name.chars()
        .enumerate()
        .map(|(i, c)| {
            let valid = if i == 0 {
                // Matches a regular expression of [a-zA-Z_:].
                c.is_ascii_alphabetic() || c == '_' || c == ':'
            } else {
                // Matches a regular expression of [a-zA-Z0-9_:].
                c.is_ascii_alphanumeric() || c == '_' || c == ':'
            };
            if valid {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone as _, Utc};

    use super::*;
    use crate::{
        config::{CorrelationLabel, DistributionConfig},
        correlation::CorrelationId,
    };

    fn registry(label: &str) -> MetricsRegistry {
        let config = EmitterConfig {
            distribution: DistributionConfig::new(0.0, 2.0).unwrap(),
            bucket_count: 4,
            metric_name: "rpc_seconds".to_string(),
            correlation_label: CorrelationLabel::new(label).unwrap(),
            ..Default::default()
        };
        MetricsRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn empty_exposition() {
        let registry = registry("traceId");
        let expected = "\
# HELP rpc_seconds RPC latency distributions.
# TYPE rpc_seconds histogram
rpc_seconds_bucket{le=\"-10.0\"} 0
rpc_seconds_bucket{le=\"-9.0\"} 0
rpc_seconds_bucket{le=\"-8.0\"} 0
rpc_seconds_bucket{le=\"-7.0\"} 0
rpc_seconds_bucket{le=\"+Inf\"} 0
rpc_seconds_sum 0.0
rpc_seconds_count 0
# EOF
";
        assert_eq!(registry.render(), expected);
    }

    #[test]
    fn exposition_with_exemplars() {
        let registry = registry("requestId").with_build_info("exemplar-emitter", "1.2.3");
        let timestamp = Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
        registry
            .histogram()
            .observe_with_exemplar_at(-8.5, &CorrelationId::from_trace_id(0xabc), timestamp);
        registry
            .histogram()
            .observe_with_exemplar_at(3.0, &CorrelationId::from_trace_id(0xdef), timestamp);

        let rendered = registry.render();
        let lines = rendered.lines().collect::<Vec<_>>();

        assert_eq!(lines[2], "rpc_seconds_bucket{le=\"-10.0\"} 0");
        assert_eq!(lines[3], "rpc_seconds_bucket{le=\"-9.0\"} 0");
        assert_eq!(
            lines[4],
            "rpc_seconds_bucket{le=\"-8.0\"} 1 # {requestId=\"00000000000000000000000000000abc\"} -8.5 1700000000.250"
        );
        assert_eq!(lines[5], "rpc_seconds_bucket{le=\"-7.0\"} 1");
        assert_eq!(
            lines[6],
            "rpc_seconds_bucket{le=\"+Inf\"} 2 # {requestId=\"00000000000000000000000000000def\"} 3.0 1700000000.250"
        );
        assert_eq!(lines[7], "rpc_seconds_sum -5.5");
        assert_eq!(lines[8], "rpc_seconds_count 2");
        assert_eq!(lines[10], "# TYPE exemplar_emitter_build_info gauge");
        assert_eq!(lines[11], "exemplar_emitter_build_info{version=\"1.2.3\"} 1");
        assert_eq!(lines.last(), Some(&"# EOF"));
    }

    #[test]
    fn float_rendering() {
        let render = |value| {
            let mut s = String::new();
            write_float(&mut s, value).unwrap();
            s
        };

        assert_eq!(render(5.0), "5.0");
        assert_eq!(render(-0.25), "-0.25");
        assert_eq!(render(f64::INFINITY), "+Inf");
        assert_eq!(render(f64::NAN), "NaN");
    }

    #[test]
    fn label_value_escaping() {
        let mut s = String::new();
        write_escaped_label_value(&mut s, "a\"b\\c\nd").unwrap();
        assert_eq!(s, "a\\\"b\\\\c\\nd");
    }

    #[test]
    fn rejects_invalid_config() {
        let config = EmitterConfig {
            bucket_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            MetricsRegistry::from_config(&config),
            Err(ConfigurationError::ZeroBucketCount)
        ));
    }
}
