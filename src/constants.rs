//! Общие константы форматирования, чтобы не дублировать строки и единицы измерения.

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const UNIT_KWH: &str = "kWh";
pub const AXIS_LABEL_ENERGY: &str = "Energy Use (kWh)";
pub const AXIS_LABEL_DATE: &str = "Date";
