//! Installed-apps line parser
//!
//! Input lines carry five tab-separated fields:
//!
//! ```text
//! device_type \t device_id \t lat \t lon \t app_id,app_id,...
//! ```

use crate::error::ParseError;
use crate::record::AppsInstalled;

/// Parse one input line into a record
///
/// Surrounding whitespace is trimmed before splitting. A line is rejected as
/// a whole: a single bad app id or coordinate drops the line rather than
/// producing a partial record.
pub fn parse_apps_installed(line: &str) -> Result<AppsInstalled, ParseError> {
    let line = line.trim();
    let fields: Vec<&str> = line.split('\t').collect();

    let [device_type, device_id, lat, lon, raw_apps] = fields[..] else {
        return Err(ParseError::MalformedRow {
            fields: fields.len(),
        });
    };

    if device_type.is_empty() || device_id.is_empty() {
        return Err(ParseError::MissingIdentity);
    }

    let apps = parse_apps(raw_apps)?;
    let lat = parse_coordinate(lat)?;
    let lon = parse_coordinate(lon)?;

    Ok(AppsInstalled {
        device_type: device_type.to_string(),
        device_id: device_id.to_string(),
        lat,
        lon,
        apps,
    })
}

fn parse_apps(raw: &str) -> Result<Vec<u32>, ParseError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    raw.split(',')
        .map(|token| {
            let token = token.trim();
            token
                .parse::<u32>()
                .map_err(|_| ParseError::InvalidAppId(token.to_string()))
        })
        .collect()
}

fn parse_coordinate(raw: &str) -> Result<f64, ParseError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| ParseError::InvalidGeo(raw.to_string()))
}
