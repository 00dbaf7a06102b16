//! Alarm code descriptions.
//!
//! Only the low byte of an alarm register carries the alarm code. Codes above `0x7F` are "A"
//! class alarms (which stop the unit) and are displayed with `0x7F` subtracted, everything else is
//! a "B" class warning. For example `0x84` is displayed as `5A` and `0x04` as `4B`.

const MESSAGES: &[(u8, &str)] = &[
    (1, "LOW_SUPPLY_AIRFLOW"),
    (2, "LOW_EXTRACT_AIRFLOW"),
    (3, "VAV_CALIBRATION_FAIL"),
    (4, "CHANGE_OUTDOOR_AIR_FILTER"),
    (5, "CHANGE_EXTRACT_AIR_FILTER"),
    (12, "HIGH_PRESSURE_ON_COMPRESSOR"),
    (13, "LOW_PRESSURE_ON_COMPRESSOR"),
    (14, "SERVICE_TIME"),
    (15, "EVAPORATOR_ICING"),
    (16, "COMPRESSOR_FAILURE"),
    (19, "COMPRESSOR_OFF_AIRFLOW"),
    (20, "COMPRESSOR_OFF_TEMPERATURE"),
    (95, "LOW_HEAT_EXCHANGER_EFFICIENCY"),
    (112, "WATER_PUMP_OR_COIL_ALARM"),
    (127, "SERVICE_MODE"),
];

const RANGES: &[(std::ops::RangeInclusive<u8>, &str)] = &[
    (6..=11, "ELECTRIC_HEATER_OFF"),
    (96..=111, "COMPRESSOR_OFF_MALFUNCTION"),
];

pub const UNKNOWN: &str = "UNKNOWN";

pub fn message_for_code(code: u16) -> &'static str {
    let code = code as u8;
    if let Some((_, message)) = MESSAGES.iter().find(|(c, _)| *c == code) {
        return *message;
    }
    RANGES
        .iter()
        .find(|(range, _)| range.contains(&code))
        .map_or(UNKNOWN, |(_, message)| *message)
}

/// The code as it is shown on the control panel.
pub fn code_str(code: u16) -> String {
    let code = code & 0xFF;
    if code > 0x7F { format!("{}A", code - 0x7F) } else { format!("{code}B") }
}
