// Architecture support. This kernel targets x86-64 only.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("arbor-kernel supports only x86_64");
