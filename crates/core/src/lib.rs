//! Data model and configuration for the stepwise task-run reconciler.
//!
//! A [`Run`] binds parameters and resources to a [`TaskSpec`]; the
//! reconciler turns it into a pod and projects the pod's outcome back onto
//! [`RunStatus`].

pub mod condition;
pub mod config;
pub mod duration;
pub mod error;
pub mod notification;
pub mod resource;
pub mod result;
pub mod run;
pub mod task;

pub use condition::{Condition, ConditionStatus, Reason};
pub use config::{ControllerConfig, EntrypointPolicy, Images, NotificationConfig};
pub use duration::{format_duration, parse_duration};
pub use error::Error;
pub use notification::{DeliveryStatus, NotificationDeliveryRecord};
pub use resource::{NamedResource, ResourceParam, ResourceSpec, ResourceType};
pub use result::{GenericResultExt, Result};
pub use run::{
    Param, ResourceBinding, ResourceResult, Run, RunKey, RunMeta, RunSpec, RunStatus, StepPhase,
    StepState,
};
pub use task::{
    ParamSpec, ParamType, ParamValue, ResourceDeclaration, Step, TaskKind, TaskRef, TaskSpec,
};
