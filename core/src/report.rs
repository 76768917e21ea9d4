/// Best-effort training telemetry: one JSON line per iteration over TCP.
///
/// Delivery failures never reach the training loop. The `Reporter` logs the
/// first failure with `warn!`, drops the sink and keeps going.

use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Per-iteration telemetry record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    pub iteration: u64,
    /// Mean per-bit log-loss over the replay steps, in bits.
    pub average_loss: f64,
    pub elapsed_ms: u64,
    pub sequence_length: usize,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report sink connection failed: {0}")]
    Connect(std::io::Error),
    #[error("report send failed: {0}")]
    Send(std::io::Error),
    #[error("report encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for iteration reports.
pub trait ReportSink {
    fn send(&mut self, report: &IterationReport) -> Result<(), ReportError>;
}

/// Newline-delimited JSON over a TCP connection.
pub struct TcpReportSink {
    stream: TcpStream,
}

impl TcpReportSink {
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, ReportError> {
        let addrs: Vec<_> = addr.to_socket_addrs().map_err(ReportError::Connect)?.collect();
        let mut last_err = std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing");
        for a in addrs {
            match TcpStream::connect_timeout(&a, timeout) {
                Ok(stream) => {
                    stream.set_write_timeout(Some(timeout)).map_err(ReportError::Connect)?;
                    return Ok(TcpReportSink { stream });
                }
                Err(e) => last_err = e,
            }
        }
        Err(ReportError::Connect(last_err))
    }
}

impl ReportSink for TcpReportSink {
    fn send(&mut self, report: &IterationReport) -> Result<(), ReportError> {
        let mut line = serde_json::to_vec(report)?;
        line.push(b'\n');
        self.stream.write_all(&line).map_err(ReportError::Send)?;
        self.stream.flush().map_err(ReportError::Send)
    }
}

/// Wraps an optional sink; disables it after the first failure.
pub struct Reporter {
    sink: Option<Box<dyn ReportSink>>,
}

impl Reporter {
    pub fn new(sink: Box<dyn ReportSink>) -> Self {
        Reporter { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Reporter { sink: None }
    }

    /// Try to connect; an unreachable endpoint gives a disabled reporter.
    pub fn connect_tcp(addr: &str, timeout: Duration) -> Self {
        match TcpReportSink::connect(addr, timeout) {
            Ok(sink) => {
                info!(%addr, "streaming iteration reports");
                Reporter::new(Box::new(sink))
            }
            Err(e) => {
                warn!(%addr, error = %e, "report sink unavailable, continuing without it");
                Reporter::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn report(&mut self, report: &IterationReport) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.send(report) {
                warn!(iteration = report.iteration, error = %e, "report sink failed, disabling it");
                self.sink = None;
            }
        }
    }
}

/// Fixed-capacity moving average (ring buffer).
#[derive(Clone, Debug)]
pub struct LossWindow {
    values: Vec<f64>,
    capacity: usize,
    next: usize,
}

impl LossWindow {
    pub fn new(capacity: usize) -> Self {
        LossWindow { values: Vec::with_capacity(capacity), capacity: capacity.max(1), next: 0 }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() < self.capacity {
            self.values.push(value);
        } else {
            self.values[self.next] = value;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Mean of the retained values; 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recording {
        sent: Rc<RefCell<Vec<IterationReport>>>,
        fail_after: usize,
    }

    impl ReportSink for Recording {
        fn send(&mut self, report: &IterationReport) -> Result<(), ReportError> {
            if self.sent.borrow().len() >= self.fail_after {
                return Err(ReportError::Send(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")));
            }
            self.sent.borrow_mut().push(report.clone());
            Ok(())
        }
    }

    fn report(i: u64) -> IterationReport {
        IterationReport { iteration: i, average_loss: 0.5, elapsed_ms: 3, sequence_length: 4 }
    }

    #[test]
    fn test_reporter_disables_after_failure() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let mut r = Reporter::new(Box::new(Recording { sent: sent.clone(), fail_after: 2 }));
        for i in 0..5 {
            r.report(&report(i));
        }
        assert!(!r.is_enabled());
        assert_eq!(sent.borrow().len(), 2);
        assert_eq!(sent.borrow()[1].iteration, 1);
    }

    #[test]
    fn test_disabled_reporter_is_noop() {
        let mut r = Reporter::disabled();
        r.report(&report(1));
        assert!(!r.is_enabled());
    }

    #[test]
    fn test_report_json_fields() {
        let json = serde_json::to_value(report(7)).unwrap();
        assert_eq!(json["iteration"], 7);
        assert_eq!(json["average_loss"], 0.5);
        assert_eq!(json["elapsed_ms"], 3);
        assert_eq!(json["sequence_length"], 4);
    }

    #[test]
    fn test_loss_window_moving_average() {
        let mut w = LossWindow::new(3);
        assert_eq!(w.mean(), 0.0);
        w.push(1.0);
        w.push(2.0);
        assert_eq!(w.mean(), 1.5);
        w.push(3.0);
        w.push(7.0); // evicts 1.0
        assert_eq!(w.len(), 3);
        assert_eq!(w.mean(), 4.0);
    }
}
