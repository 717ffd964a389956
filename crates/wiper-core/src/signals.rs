/// Default root of the wiper signal group in the vehicle signal tree.
pub const WIPER_ROOT: &str = "Vehicle.Body.Windshield.Front.Wiping.System";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    String,
    Uint8,
    Float,
    Bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Signal {
    pub leaf: &'static str,
    pub data_type: DataType,
    pub metric: &'static str,
    pub description: &'static str,
}

impl Signal {
    /// Full dotted path below `root`.
    pub fn path(&self, root: &str) -> String {
        format!("{root}.{}", self.leaf)
    }
}

pub const MODE: Signal = Signal {
    leaf: "Mode",
    data_type: DataType::String,
    metric: "wiper_mode",
    description: "Requested mode of wiper system. STOP_HOLD means that the wipers shall move to position given by TargetPosition and then hold the position. WIPE means that wipers shall move to the position given by TargetPosition and then hold the position if no new TargetPosition is requested. PLANT_MODE means that wiping is disabled. EMERGENCY_STOP means that wiping shall be immediately stopped.",
};

pub const FREQUENCY: Signal = Signal {
    leaf: "Frequency",
    data_type: DataType::Uint8,
    metric: "wiper_frequency_cpm",
    description: "Wiping frequency/speed, measured in cycles per minute.",
};

pub const TARGET_POSITION: Signal = Signal {
    leaf: "TargetPosition",
    data_type: DataType::Float,
    metric: "wiper_target_position_degrees",
    description: "Requested position of main wiper blade for the wiper system relative to reference position.",
};

pub const ACTUAL_POSITION: Signal = Signal {
    leaf: "ActualPosition",
    data_type: DataType::Float,
    metric: "wiper_actual_position_degrees",
    description: "Actual position of main wiper blade for the wiper system relative to reference position.",
};

pub const DRIVE_CURRENT: Signal = Signal {
    leaf: "DriveCurrent",
    data_type: DataType::Float,
    metric: "wiper_drive_current_amperes",
    description: "Actual current used by wiper drive.",
};

pub const IS_WIPING: Signal = Signal {
    leaf: "IsWiping",
    data_type: DataType::Bool,
    metric: "wiper_is_wiping",
    description: "True if wiper blades are moving.",
};

pub const IS_ENDING_WIPE_CYCLE: Signal = Signal {
    leaf: "IsEndingWipeCycle",
    data_type: DataType::Bool,
    metric: "wiper_is_ending_wipe_cycle",
    description: "Indicates if current wipe movement is completed or near completion.",
};

pub const IS_WIPER_ERROR: Signal = Signal {
    leaf: "IsWiperError",
    data_type: DataType::Bool,
    metric: "wiper_is_error",
    description: "Indicates system failure. True if wiping is disabled due to system failure.",
};

pub const IS_POSITION_REACHED: Signal = Signal {
    leaf: "IsPositionReached",
    data_type: DataType::Bool,
    metric: "wiper_is_position_reached",
    description: "Indicates if a requested position has been reached.",
};

pub const IS_BLOCKED: Signal = Signal {
    leaf: "IsBlocked",
    data_type: DataType::Bool,
    metric: "wiper_is_blocked",
    description: "Indicates if wiper movement is blocked.",
};

pub const IS_OVERHEATED: Signal = Signal {
    leaf: "IsOverheated",
    data_type: DataType::Bool,
    metric: "wiper_is_overheated",
    description: "Indicates if wiper system is overheated.",
};

/// Signals written by the aggregation service and consumed as actuator targets.
pub const ACTUATOR_TARGETS: [Signal; 3] = [MODE, FREQUENCY, TARGET_POSITION];

/// Signals fed from decoded telemetry.
pub const SENSORS: [Signal; 8] = [
    ACTUAL_POSITION,
    DRIVE_CURRENT,
    IS_WIPING,
    IS_BLOCKED,
    IS_ENDING_WIPE_CYCLE,
    IS_OVERHEATED,
    IS_POSITION_REACHED,
    IS_WIPER_ERROR,
];

pub const ALL: [Signal; 11] = [
    MODE,
    FREQUENCY,
    TARGET_POSITION,
    ACTUAL_POSITION,
    DRIVE_CURRENT,
    IS_WIPING,
    IS_ENDING_WIPE_CYCLE,
    IS_WIPER_ERROR,
    IS_POSITION_REACHED,
    IS_BLOCKED,
    IS_OVERHEATED,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_dotted_below_root() {
        assert_eq!(
            MODE.path(WIPER_ROOT),
            "Vehicle.Body.Windshield.Front.Wiping.System.Mode"
        );
        assert_eq!(IS_BLOCKED.path("A.B"), "A.B.IsBlocked");
    }

    #[test]
    fn leaves_are_unique() {
        let mut leaves: Vec<_> = ALL.iter().map(|s| s.leaf).collect();
        leaves.sort_unstable();
        leaves.dedup();
        assert_eq!(leaves.len(), ALL.len());
    }
}
