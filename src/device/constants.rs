use uuid::Uuid;

/**
 * How long (milliseconds) the peripheral gets to process one value before the next one is written.
 */
pub const SETTLE_DELAY: u64 = 150;

/**
 * How long (milliseconds) a complete write operation may take, from submission until the last
 * value has been read back.
 */
pub const OPERATION_TIMEOUT: u64 = 70_000;

/**
 * Written (and read back) once before the real values to confirm that the link is write-capable.
 * It is outside of the valid percentage range so the peripheral can tell it apart.
 */
pub const PRIMING_BYTE: u8 = 101;

/**
 * The UUID of the Bluetooth BLE service that holds the configuration characteristic.
 */
pub const CONFIG_SERVICE: &str = "f000aa10-0451-4000-b000-000000000000";

/**
 * The UUID of the Bluetooth BLE remote GATT characteristic that configuration values are written to.
 */
pub const CONFIG_VALUE_CHARACTERISTIC: &str = "f000aa12-0451-4000-b000-000000000000";

/**
 * Advertised identity ("<name> <address>") of the peripheral to scan for when nothing else is configured.
 */
pub const DEFAULT_SCAN_TARGET: &str = "SensorTag 34:B1:F7:D1:35:03";

/**
 * Number of configuration values the peripheral expects in one operation.
 */
pub const DEFAULT_SLOT_COUNT: usize = 4;

/**
 * How long (milliseconds) the simulated peripheral takes to complete a request.
 */
pub const SIMULATED_LATENCY: u64 = 5;

pub const CONFIG_SERVICE_UUID: Uuid = Uuid::from_u128(0xf000aa10_0451_4000_b000_000000000000);
pub const CONFIG_VALUE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xf000aa12_0451_4000_b000_000000000000);
