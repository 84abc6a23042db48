use pumplink_lib::alerts::{Alert, AlertEvent, AlertKind, AlertSink};
use pumplink_lib::status::Reading;
use pumplink_lib::{PumpError, ReadingSink};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

/// Writes one JSON object per line, to a file or stdout.
pub struct JsonLinesSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    pub fn stdout() -> Self {
        Self {
            out: Mutex::new(Box::new(io::stdout())),
        }
    }

    /// Appends to `path`, creating it if needed.
    pub fn append(path: &Path) -> io::Result<Self> {
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Mutex::new(Box::new(file)),
        })
    }

    pub fn open(path: Option<&Path>) -> io::Result<Self> {
        match path {
            Some(path) => Self::append(path),
            None => Ok(Self::stdout()),
        }
    }

    fn write<T: Serialize>(&self, value: &T) -> Result<(), PumpError> {
        let line = serde_json::to_string(value).map_err(|e| PumpError::Sink(e.to_string()))?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| PumpError::Sink("output lock poisoned".into()))?;
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

impl ReadingSink for JsonLinesSink {
    fn accept(&self, reading: &Reading) -> Result<(), PumpError> {
        self.write(reading)
    }
}

impl AlertSink for JsonLinesSink {
    fn raise(&self, alert: &Alert) -> Result<(), PumpError> {
        self.write(&AlertEvent::Raised(alert.clone()))
    }

    fn clear(&self, kind: AlertKind) -> Result<(), PumpError> {
        self.write(&AlertEvent::Cleared { kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumplink_lib::status::BatteryReading;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_one_line_per_value() {
        let buffer = Shared::default();
        let sink = JsonLinesSink {
            out: Mutex::new(Box::new(buffer.clone())),
        };
        sink.accept(&Reading::Battery(BatteryReading {
            percent: 64,
            charging: true,
        }))
        .unwrap();
        sink.clear(AlertKind::Low).unwrap();

        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"type":"battery","percent":64,"charging":true}"#);
        assert_eq!(lines[1], r#"{"action":"cleared","kind":"low"}"#);
    }
}
