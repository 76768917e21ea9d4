/// Telemetry sink over a local TCP listener.

use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::time::Duration;

use ntm_core::report::{IterationReport, Reporter};

fn report(iteration: u64) -> IterationReport {
    IterationReport { iteration, average_loss: 0.75, elapsed_ms: 12, sequence_length: 7 }
}

#[test]
fn test_reports_arrive_as_json_lines() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let mut reporter = Reporter::connect_tcp(&addr, Duration::from_secs(2));
    assert!(reporter.is_enabled());

    let (stream, _) = listener.accept().unwrap();
    reporter.report(&report(1));
    reporter.report(&report(2));
    drop(reporter);

    let lines: Vec<IterationReport> = BufReader::new(stream)
        .lines()
        .map(|l| serde_json::from_str(&l.unwrap()).unwrap())
        .collect();
    assert_eq!(lines, vec![report(1), report(2)]);
}

#[test]
fn test_unreachable_sink_disables_reporter() {
    // bind then drop so the port is very likely closed
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let mut reporter = Reporter::connect_tcp(&addr, Duration::from_millis(200));
    assert!(!reporter.is_enabled());
    reporter.report(&report(1));
    assert!(!reporter.is_enabled());
}

#[test]
fn test_unresolvable_address_disables_reporter() {
    let reporter = Reporter::connect_tcp("not an address", Duration::from_millis(200));
    assert!(!reporter.is_enabled());
}
