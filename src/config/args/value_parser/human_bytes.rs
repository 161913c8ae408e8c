use byte_unit::Byte;
use std::str::FromStr;

use crate::config::{MAXIMUM_CHUNKSIZE, MINIMUM_CHUNKSIZE};

const UNDER_MIN_VALUE: &str = "must be greater than or equal to 5MiB";
const OVER_MAX_VALUE: &str = "must be smaller than or equal to 5GiB";

pub fn check_human_bytes(value: &str) -> Result<String, String> {
    let result = Byte::from_str(value).map_err(|e| e.to_string())?;

    if result.as_u128() < MINIMUM_CHUNKSIZE as u128 {
        return Err(UNDER_MIN_VALUE.to_string());
    }
    if result.as_u128() > MAXIMUM_CHUNKSIZE as u128 {
        return Err(OVER_MAX_VALUE.to_string());
    }

    Ok(value.to_string())
}

pub fn parse_human_bytes(value: &str) -> Result<u64, String> {
    check_human_bytes(value)?;

    let result = Byte::from_str(value).map_err(|e| e.to_string())?;
    u64::try_from(result.as_u128()).map_err(|e| e.to_string())
}
