pub(crate) mod preloader;

pub(crate) use preloader::{GetHwCode, GetHwSwVer, GetTargetConfig, JumpDa, Read16, Read32};
