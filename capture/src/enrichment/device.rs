use woothee::parser::Parser;

use crate::event::Device;

const UNKNOWN: &str = "UNKNOWN";
const CRAWLER_CATEGORY: &str = "crawler";

fn known(value: &str) -> Option<String> {
    if value.is_empty() || value == UNKNOWN {
        None
    } else {
        Some(value.to_string())
    }
}

/// Device attributes from a user agent string. Unrecognized agents give an all-null device.
pub fn parse_device(user_agent: &str) -> Device {
    let parser = Parser::new();
    let result = parser.parse(user_agent).unwrap_or_default();

    Device {
        device_type: known(result.category),
        brand: known(result.vendor),
        // not exposed by the parser
        model: None,
        browser: known(result.name),
        browser_version: known(result.version),
        os: known(result.os),
        os_version: known(&result.os_version),
        is_bot: result.category == CRAWLER_CATEGORY,
    }
}
