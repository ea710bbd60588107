use rusqlite::{params, OptionalExtension};

use crate::error::StoreError;
use crate::model::{Alert, AlertStatus, Severity};

use super::Store;

fn severity_str(s: Severity) -> &'static str {
    match s {
        Severity::Info => "info",
        Severity::Warning => "warning",
        Severity::Critical => "critical",
    }
}

fn parse_severity(raw: &str) -> Severity {
    match raw {
        "warning" => Severity::Warning,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}

fn status_str(s: AlertStatus) -> &'static str {
    match s {
        AlertStatus::Firing => "firing",
        AlertStatus::Resolved => "resolved",
    }
}

fn parse_status(raw: &str) -> AlertStatus {
    match raw {
        "resolved" => AlertStatus::Resolved,
        _ => AlertStatus::Firing,
    }
}

fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<Alert> {
    Ok(Alert {
        alert_id: row.get(0)?,
        service_name: row.get(1)?,
        metric_name: row.get(2)?,
        severity: parse_severity(&row.get::<_, String>(3)?),
        status: parse_status(&row.get::<_, String>(4)?),
        message: row.get(5)?,
        current_value: row.get(6)?,
        expected_min: row.get(7)?,
        expected_max: row.get(8)?,
        breach_count: row.get::<_, i64>(9)? as u64,
        first_triggered: row.get(10)?,
        last_triggered: row.get(11)?,
        resolved_at: row.get(12)?,
    })
}

const ALERT_COLUMNS: &str = "alert_id, service_name, metric_name, severity, status, message,
     current_value, expected_min, expected_max, breach_count, first_triggered,
     last_triggered, resolved_at";

impl Store {
    /// The currently-firing alert for a service/metric pair, if any. The
    /// alert engine consults this before deciding whether a breach is
    /// new (start `first_triggered`) or a continuation (bump
    /// `breach_count`/`last_triggered`).
    pub fn active_alert(&self, service_name: &str, metric_name: &str) -> Result<Option<Alert>, StoreError> {
        let conn = self.pool().get()?;
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts
             WHERE service_name = ?1 AND metric_name = ?2 AND status = 'firing'"
        );
        let alert = conn.query_row(&sql, params![service_name, metric_name], row_to_alert).optional()?;
        Ok(alert)
    }

    pub fn upsert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let conn = self.pool().get()?;
        conn.execute(
            &format!(
                "INSERT INTO alerts ({ALERT_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
                 ON CONFLICT(alert_id) DO UPDATE SET
                    status = excluded.status,
                    message = excluded.message,
                    current_value = excluded.current_value,
                    expected_min = excluded.expected_min,
                    expected_max = excluded.expected_max,
                    breach_count = excluded.breach_count,
                    last_triggered = excluded.last_triggered,
                    resolved_at = excluded.resolved_at"
            ),
            params![
                alert.alert_id,
                alert.service_name,
                alert.metric_name,
                severity_str(alert.severity),
                status_str(alert.status),
                alert.message,
                alert.current_value,
                alert.expected_min,
                alert.expected_max,
                alert.breach_count as i64,
                alert.first_triggered,
                alert.last_triggered,
                alert.resolved_at,
            ],
        )?;
        Ok(())
    }

    /// The most recently resolved alert for a service/metric pair, if any.
    /// The alert engine consults this to decide whether a fresh breach
    /// within the cooldown window should reopen the same alert (keeping its
    /// `alert_id`/`first_triggered`) rather than starting a new one.
    pub fn last_resolved_alert(&self, service_name: &str, metric_name: &str) -> Result<Option<Alert>, StoreError> {
        let conn = self.pool().get()?;
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts
             WHERE service_name = ?1 AND metric_name = ?2 AND status = 'resolved'
             ORDER BY resolved_at DESC LIMIT 1"
        );
        let alert = conn.query_row(&sql, params![service_name, metric_name], row_to_alert).optional()?;
        Ok(alert)
    }

    pub fn resolve_alert(&self, alert_id: &str, resolved_at_ms: i64) -> Result<(), StoreError> {
        let conn = self.pool().get()?;
        conn.execute(
            "UPDATE alerts SET status = 'resolved', resolved_at = ?1 WHERE alert_id = ?2",
            params![resolved_at_ms, alert_id],
        )?;
        Ok(())
    }

    pub fn list_active_alerts(&self, service_name: Option<&str>) -> Result<Vec<Alert>, StoreError> {
        let conn = self.pool().get()?;
        let mut out = Vec::new();
        match service_name {
            Some(svc) => {
                let sql = format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts WHERE status = 'firing' AND service_name = ?1
                     ORDER BY last_triggered DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([svc], row_to_alert)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let sql = format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts WHERE status = 'firing' ORDER BY last_triggered DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], row_to_alert)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// All alerts regardless of status (firing and resolved), most recent
    /// `last_triggered` first, bounded to `limit` rows. Backs `GET
    /// /alerts`, which spec.md §6 distinguishes from the firing-only `GET
    /// /alerts/active`.
    pub fn list_alerts(&self, service_name: Option<&str>, limit: u32) -> Result<Vec<Alert>, StoreError> {
        let conn = self.pool().get()?;
        let mut out = Vec::new();
        match service_name {
            Some(svc) => {
                let sql = format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts WHERE service_name = ?1
                     ORDER BY last_triggered DESC LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![svc, limit], row_to_alert)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts ORDER BY last_triggered DESC LIMIT ?1");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![limit], row_to_alert)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Counts of firing alerts by severity, used by `/v1/alerts/summary` and
    /// the health score calculator.
    pub fn alert_summary(&self) -> Result<Vec<(Severity, u64)>, StoreError> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT severity, COUNT(*) FROM alerts WHERE status = 'firing' GROUP BY severity",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((parse_severity(&row.get::<_, String>(0)?), row.get::<_, i64>(1)? as u64))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn temp_store() -> Store {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!("vantage-alert-test-{nanos}.db"));
        Store::open_writer(path.to_str().unwrap()).unwrap()
    }

    fn sample_alert() -> Alert {
        Alert {
            alert_id: "a1".into(),
            service_name: "svc".into(),
            metric_name: "latency".into(),
            severity: Severity::Warning,
            status: AlertStatus::Firing,
            message: "latency above expected range".into(),
            current_value: 500.0,
            expected_min: 100.0,
            expected_max: 300.0,
            breach_count: 1,
            first_triggered: 1_000,
            last_triggered: 1_000,
            resolved_at: None,
        }
    }

    #[test]
    fn upsert_then_active_lookup_round_trips() {
        let store = temp_store();
        store.upsert_alert(&sample_alert()).unwrap();
        let active = store.active_alert("svc", "latency").unwrap().unwrap();
        assert_eq!(active.breach_count, 1);
        assert_eq!(active.status, AlertStatus::Firing);
    }

    #[test]
    fn resolve_clears_active_lookup() {
        let store = temp_store();
        store.upsert_alert(&sample_alert()).unwrap();
        store.resolve_alert("a1", 2_000).unwrap();
        assert!(store.active_alert("svc", "latency").unwrap().is_none());
    }

    #[test]
    fn last_resolved_alert_finds_most_recent_resolution() {
        let store = temp_store();
        store.upsert_alert(&sample_alert()).unwrap();
        store.resolve_alert("a1", 2_000).unwrap();
        let resolved = store.last_resolved_alert("svc", "latency").unwrap().unwrap();
        assert_eq!(resolved.alert_id, "a1");
        assert_eq!(resolved.resolved_at, Some(2_000));
    }

    #[test]
    fn breach_count_bump_persists_via_upsert() {
        let store = temp_store();
        let mut alert = sample_alert();
        store.upsert_alert(&alert).unwrap();
        alert.breach_count = 3;
        alert.last_triggered = 5_000;
        store.upsert_alert(&alert).unwrap();
        let active = store.active_alert("svc", "latency").unwrap().unwrap();
        assert_eq!(active.breach_count, 3);
        assert_eq!(active.last_triggered, 5_000);
        assert_eq!(active.first_triggered, 1_000);
    }
}
