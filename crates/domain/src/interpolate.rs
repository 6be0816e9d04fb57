use chrono::{DateTime, Utc};

/// Substitution values for `${...}` placeholders in topic and client-id
/// patterns.
#[derive(Debug, Clone, Copy)]
pub struct PatternContext<'a> {
    pub device_id: &'a str,
    pub model_id: &'a str,
    pub group_id: Option<&'a str>,
}

/// Expands a pattern. Known placeholders: `${deviceId}`, `${modelId}`,
/// `${groupId}`, `${timestamp}` and `${env:NAME}`. Unknown placeholders are
/// left in place rather than silently dropped.
pub fn interpolate(
    pattern: &str,
    ctx: &PatternContext<'_>,
    timestamp: Option<DateTime<Utc>>,
) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match key {
                    "deviceId" => out.push_str(ctx.device_id),
                    "modelId" => out.push_str(ctx.model_id),
                    "groupId" => out.push_str(ctx.group_id.unwrap_or("")),
                    "timestamp" => {
                        let ts = timestamp.unwrap_or_else(Utc::now);
                        out.push_str(&ts.timestamp_millis().to_string());
                    }
                    _ => {
                        if let Some(var) = key.strip_prefix("env:") {
                            match std::env::var(var) {
                                Ok(value) => out.push_str(&value),
                                Err(_) => {
                                    out.push_str("${");
                                    out.push_str(key);
                                    out.push('}');
                                }
                            }
                        } else {
                            out.push_str("${");
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder; emit verbatim.
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

/// True when the pattern must be re-resolved per publish.
pub fn needs_timestamp(pattern: &str) -> bool {
    pattern.contains("${timestamp}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>() -> PatternContext<'a> {
        PatternContext {
            device_id: "t1-0",
            model_id: "t1",
            group_id: Some("G"),
        }
    }

    #[test]
    fn test_device_and_model_placeholders() {
        assert_eq!(interpolate("s/${deviceId}/t", &ctx(), None), "s/t1-0/t");
        assert_eq!(
            interpolate("${modelId}-${deviceId}", &ctx(), None),
            "t1-t1-0"
        );
    }

    #[test]
    fn test_group_placeholder_empty_without_group() {
        let ctx = PatternContext {
            device_id: "d",
            model_id: "m",
            group_id: None,
        };
        assert_eq!(interpolate("g/${groupId}/x", &ctx, None), "g//x");
    }

    #[test]
    fn test_timestamp_placeholder() {
        let ts = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        assert_eq!(
            interpolate("t/${timestamp}", &ctx(), Some(ts)),
            "t/1700000000000"
        );
        assert!(needs_timestamp("t/${timestamp}"));
        assert!(!needs_timestamp("t/${deviceId}"));
    }

    #[test]
    fn test_env_placeholder() {
        // SAFETY: test-local variable, no concurrent reader cares
        unsafe { std::env::set_var("INTERP_TEST_SITE", "plant7") };
        assert_eq!(interpolate("${env:INTERP_TEST_SITE}/x", &ctx(), None), "plant7/x");
    }

    #[test]
    fn test_unknown_placeholder_kept() {
        assert_eq!(interpolate("a/${bogus}/b", &ctx(), None), "a/${bogus}/b");
    }

    #[test]
    fn test_unterminated_placeholder_kept() {
        assert_eq!(interpolate("a/${deviceId", &ctx(), None), "a/${deviceId");
    }
}
