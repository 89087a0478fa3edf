/// Labels attached to every metric a component emits.
#[derive(Debug, Clone, Default)]
pub struct TelemetryLabels {
    pub backend: String,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(1 + self.extra.len());
        tags.push(("backend".into(), self.backend.clone()));
        tags.extend(self.extra.iter().cloned());
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_label_comes_first() {
        let labels = TelemetryLabels::new("loopback").with_label("outcome", "settled");
        assert_eq!(
            labels.tags(),
            vec![
                ("backend".to_string(), "loopback".to_string()),
                ("outcome".to_string(), "settled".to_string())
            ]
        );
    }
}
