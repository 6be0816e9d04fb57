use domain::metrics::{FieldValue, Point};

/// Encodes one point as a line-protocol record:
/// `measurement,tag=v field=v,field2=v2 timestamp`.
pub fn encode_point(point: &Point) -> String {
    let mut line = String::with_capacity(64);
    escape_into(&mut line, point.measurement, &[',', ' ']);

    for (key, value) in &point.tags {
        line.push(',');
        escape_into(&mut line, key, &[',', '=', ' ']);
        line.push('=');
        escape_into(&mut line, value, &[',', '=', ' ']);
    }

    line.push(' ');
    for (i, (key, value)) in point.fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        escape_into(&mut line, key, &[',', '=', ' ']);
        line.push('=');
        match value {
            FieldValue::Float(v) => line.push_str(&v.to_string()),
            FieldValue::Integer(v) => {
                line.push_str(&v.to_string());
                line.push('i');
            }
            FieldValue::Boolean(v) => line.push_str(if *v { "true" } else { "false" }),
            FieldValue::Text(v) => {
                line.push('"');
                for c in v.chars() {
                    if c == '"' || c == '\\' {
                        line.push('\\');
                    }
                    line.push(c);
                }
                line.push('"');
            }
        }
    }

    line.push(' ');
    line.push_str(&point.timestamp_ns.to_string());
    line
}

/// Encodes a batch, one record per line.
pub fn encode_batch(points: &[Point]) -> String {
    let mut body = String::with_capacity(points.len() * 64);
    for (i, point) in points.iter().enumerate() {
        if i > 0 {
            body.push('\n');
        }
        body.push_str(&encode_point(point));
    }
    body
}

fn escape_into(out: &mut String, raw: &str, special: &[char]) {
    for c in raw.chars() {
        if special.contains(&c) || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::device::Source;
    use domain::metrics::Point;

    fn fixed(mut point: Point) -> Point {
        point.timestamp_ns = 1_700_000_000_000_000_000;
        point
    }

    #[test]
    fn test_basic_point() {
        let point = fixed(
            Point::telemetry("t1-0", "t1", Some("G"), Source::Simulated)
                .field("temperature", 21.5),
        );
        assert_eq!(
            encode_point(&point),
            "telemetry,deviceId=t1-0,modelId=t1,groupId=G,source=simulated temperature=21.5 1700000000000000000"
        );
    }

    #[test]
    fn test_integer_and_bool_fields() {
        let point = fixed(
            Point::new("connections")
                .tag("deviceId", "d")
                .field("connected", true)
                .field("count", 3i64),
        );
        assert_eq!(
            encode_point(&point),
            "connections,deviceId=d connected=true,count=3i 1700000000000000000"
        );
    }

    #[test]
    fn test_escaping_spaces_and_commas_in_tags() {
        let point = fixed(Point::new("telemetry").tag("unit", "m s,v").field("x", 1.0));
        assert_eq!(
            encode_point(&point),
            "telemetry,unit=m\\ s\\,v x=1 1700000000000000000"
        );
    }

    #[test]
    fn test_string_field_quoting() {
        let point = fixed(Point::new("telemetry").field("state", "say \"hi\""));
        assert_eq!(
            encode_point(&point),
            "telemetry state=\"say \\\"hi\\\"\" 1700000000000000000"
        );
    }

    #[test]
    fn test_batch_newline_framing() {
        let a = fixed(Point::new("telemetry").field("x", 1.0));
        let b = fixed(Point::new("telemetry").field("y", 2.0));
        let body = encode_batch(&[a, b]);
        assert_eq!(body.lines().count(), 2);
        assert!(!body.ends_with('\n'));
    }
}
