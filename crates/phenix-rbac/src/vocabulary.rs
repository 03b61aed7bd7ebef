//! Resource kinds and verbs shared by the API surface and role definitions

pub mod kind {
    pub const EXPERIMENTS: &str = "experiments";
    pub const EXPERIMENTS_START: &str = "experiments/start";
    pub const EXPERIMENTS_STOP: &str = "experiments/stop";
    pub const EXPERIMENTS_SCHEDULE: &str = "experiments/schedule";
    pub const EXPERIMENTS_CAPTURES: &str = "experiments/captures";
    pub const EXPERIMENTS_FILES: &str = "experiments/files";
    pub const VMS: &str = "vms";
    pub const VMS_START: &str = "vms/start";
    pub const VMS_STOP: &str = "vms/stop";
    pub const VMS_REDEPLOY: &str = "vms/redeploy";
    pub const VMS_CAPTURES: &str = "vms/captures";
    pub const VMS_SNAPSHOTS: &str = "vms/snapshots";
    pub const VMS_COMMIT: &str = "vms/commit";
    pub const VMS_VNC: &str = "vms/vnc";
    pub const VMS_SCREENSHOT: &str = "vms/screenshot";
    pub const USERS: &str = "users";
    pub const TOPOLOGIES: &str = "topologies";
    pub const SCENARIOS: &str = "scenarios";
    pub const DISKS: &str = "disks";
    pub const HOSTS: &str = "hosts";

    pub const ALL: &[&str] = &[
        EXPERIMENTS,
        EXPERIMENTS_START,
        EXPERIMENTS_STOP,
        EXPERIMENTS_SCHEDULE,
        EXPERIMENTS_CAPTURES,
        EXPERIMENTS_FILES,
        VMS,
        VMS_START,
        VMS_STOP,
        VMS_REDEPLOY,
        VMS_CAPTURES,
        VMS_SNAPSHOTS,
        VMS_COMMIT,
        VMS_VNC,
        VMS_SCREENSHOT,
        USERS,
        TOPOLOGIES,
        SCENARIOS,
        DISKS,
        HOSTS,
    ];
}

pub mod verb {
    pub const LIST: &str = "list";
    pub const GET: &str = "get";
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const PATCH: &str = "patch";
    pub const DELETE: &str = "delete";

    pub const ALL: &[&str] = &[LIST, GET, CREATE, UPDATE, PATCH, DELETE];
}
