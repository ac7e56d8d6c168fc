use crate::model::{DataType, StreamDecl, IMPLICIT_ERROR_STREAM};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Static metadata for a sensor kind: what streams it produces and how its
/// config is validated. Individual sensor *bodies* are out of scope; this
/// registry only carries the contract workers enforce (spec.md §1, §4.5).
pub struct SensorKind {
    pub name: &'static str,
    pub streams: HashMap<&'static str, StreamDecl>,
    pub periodic: bool,
}

impl SensorKind {
    fn with_streams(
        name: &'static str,
        periodic: bool,
        streams: &[(&'static str, DataType, &'static str)],
    ) -> Self {
        let mut map: HashMap<&'static str, StreamDecl> = streams
            .iter()
            .map(|(n, dt, desc)| {
                (
                    *n,
                    StreamDecl {
                        datatype: *dt,
                        description: desc,
                    },
                )
            })
            .collect();
        map.insert(
            IMPLICIT_ERROR_STREAM,
            StreamDecl {
                datatype: DataType::String,
                description: "sensor-reported diagnostic message",
            },
        );
        Self {
            name,
            streams: map,
            periodic,
        }
    }
}

/// Registry of known sensor kinds, built once at startup (REDESIGN FLAGS §9:
/// a compile-time registry replaces runtime module import by name). New kinds
/// require a code change and recompile; that trade-off is accepted.
pub static SENSOR_REGISTRY: Lazy<HashMap<&'static str, SensorKind>> = Lazy::new(|| {
    let kinds = vec![
        SensorKind::with_streams(
            "uptime",
            true,
            &[("uptime", DataType::Duration, "seconds since boot")],
        ),
        SensorKind::with_streams(
            "loadavg",
            true,
            &[
                ("load1", DataType::Float, "1 minute load average"),
                ("load5", DataType::Float, "5 minute load average"),
                ("load15", DataType::Float, "15 minute load average"),
            ],
        ),
        SensorKind::with_streams(
            "check_http",
            true,
            &[
                ("status_code", DataType::Integer, "HTTP response status"),
                ("latency_ms", DataType::Float, "request round-trip time"),
            ],
        ),
        SensorKind::with_streams(
            "netstat",
            true,
            &[
                ("connections", DataType::Integer, "open connection count"),
            ],
        ),
    ];
    kinds.into_iter().map(|k| (k.name, k)).collect()
});

pub fn lookup(kind: &str) -> Option<&'static SensorKind> {
    SENSOR_REGISTRY.get(kind)
}

/// Validates a produced (stream, value) pair against a sensor kind's
/// declared contract (spec.md §4.5 result validation: stream declared,
/// value type matches declared primitive, primitive is registered).
pub fn validate_stream_value(
    kind: &SensorKind,
    stream: &str,
    value: &crate::model::Value,
) -> Result<DataType, String> {
    let decl = kind
        .streams
        .get(stream)
        .ok_or_else(|| format!("stream `{stream}` is not declared by sensor kind `{}`", kind.name))?;
    if !decl.datatype.matches(value) {
        return Err(format!(
            "stream `{stream}` declared type {:?} but value was {:?}",
            decl.datatype,
            value.datatype()
        ));
    }
    Ok(decl.datatype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;

    #[test]
    fn every_kind_carries_the_implicit_error_stream() {
        for kind in SENSOR_REGISTRY.values() {
            assert!(kind.streams.contains_key(IMPLICIT_ERROR_STREAM));
        }
    }

    #[test]
    fn validate_stream_value_rejects_undeclared_stream() {
        let kind = lookup("uptime").unwrap();
        let err = validate_stream_value(kind, "bogus", &Value::Float(1.0)).unwrap_err();
        assert!(err.contains("not declared"));
    }

    #[test]
    fn validate_stream_value_rejects_type_mismatch() {
        let kind = lookup("uptime").unwrap();
        let err = validate_stream_value(kind, "uptime", &Value::String("x".into())).unwrap_err();
        assert!(err.contains("declared type"));
    }

    #[test]
    fn validate_stream_value_accepts_matching_type() {
        let kind = lookup("loadavg").unwrap();
        let dt = validate_stream_value(kind, "load1", &Value::Float(0.5)).unwrap();
        assert_eq!(dt, DataType::Float);
    }
}
