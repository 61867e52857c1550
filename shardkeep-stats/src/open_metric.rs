//! OpenMetrics rendering, independent of any particular transport.

use std::ops::Deref;

pub trait OpenMetric: Send + Sync {
    fn name(&self) -> String;
    fn measurements(&self) -> Vec<Measurement>;
    fn unit(&self) -> Option<String> {
        None
    }
    fn metric_type(&self) -> String {
        "gauge".into()
    }
    fn help(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct Measurement {
    pub labels: Vec<(String, String)>,
    pub measurement: f64,
}

impl Measurement {
    pub fn render(&self, name: &str) -> String {
        let labels = if self.labels.is_empty() {
            "".into()
        } else {
            let labels = self
                .labels
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>();
            format!("{{{}}}", labels.join(","))
        };
        format!("{} {} {:.3}", name, labels, self.measurement)
    }
}

pub struct Metric {
    metric: Box<dyn OpenMetric>,
}

impl Metric {
    pub fn new(metric: impl OpenMetric + 'static) -> Self {
        Self { metric: Box::new(metric) }
    }
}

impl Deref for Metric {
    type Target = Box<dyn OpenMetric>;

    fn deref(&self) -> &Self::Target {
        &self.metric
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.name();
        writeln!(f, "# TYPE {} {}", name, self.metric_type())?;
        if let Some(unit) = self.unit() {
            writeln!(f, "# UNIT {} {}", name, unit)?;
        }
        if let Some(help) = self.help() {
            writeln!(f, "# HELP {} {}", name, help)?;
        }
        for measurement in self.measurements() {
            writeln!(f, "{}", measurement.render(&name))?;
        }
        Ok(())
    }
}

/// A single unlabeled counter or gauge, for the common case of one
/// `usize` field on a counts struct becoming one metric.
struct CounterMetric {
    name: String,
    help: String,
    metric_type: String,
    value: f64,
}

impl OpenMetric for CounterMetric {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn measurements(&self) -> Vec<Measurement> {
        vec![Measurement {
            labels: vec![],
            measurement: self.value,
        }]
    }

    fn metric_type(&self) -> String {
        self.metric_type.clone()
    }

    fn help(&self) -> Option<String> {
        Some(self.help.clone())
    }
}

impl CounterMetric {
    pub fn gauge(name: &str, help: &str, value: usize) -> Metric {
        Metric::new(Self {
            name: name.into(),
            help: help.into(),
            metric_type: "gauge".into(),
            value: value as f64,
        })
    }

    pub fn counter(name: &str, help: &str, value: usize) -> Metric {
        Metric::new(Self {
            name: name.into(),
            help: help.into(),
            metric_type: "counter".into(),
            value: value as f64,
        })
    }
}

pub fn gauge(name: &str, help: &str, value: usize) -> Metric {
    CounterMetric::gauge(name, help, value)
}

pub fn counter(name: &str, help: &str, value: usize) -> Metric {
    CounterMetric::counter(name, help, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_type_and_help() {
        let metric = gauge("shardkeep_runners_registered", "Runners currently registered.", 3);
        let rendered = metric.to_string();
        assert!(rendered.contains("# TYPE shardkeep_runners_registered gauge"));
        assert!(rendered.contains("# HELP shardkeep_runners_registered Runners currently registered."));
        assert!(rendered.contains("shardkeep_runners_registered  3.000"));
    }
}
