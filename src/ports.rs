use thiserror::Error;

use crate::types::ChildPorts;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortAssignmentError {
    #[error("Port step must be a positive integer.")]
    InvalidStep,
    #[error("Port assignment overflows u16 at child index {index}.")]
    Overflow { index: usize },
}

/// Deterministic port triplets for `count` children: the i-th child gets each
/// base port advanced by `i * step`.
pub fn assign_ports(
    count: usize,
    base_api: u16,
    base_stream: u16,
    base_debug: u16,
    step: u16,
) -> Result<Vec<ChildPorts>, PortAssignmentError> {
    if step == 0 {
        return Err(PortAssignmentError::InvalidStep);
    }

    let mut assignments = Vec::with_capacity(count);
    for index in 0..count {
        let offset = (index as u16)
            .checked_mul(step)
            .ok_or(PortAssignmentError::Overflow { index })?;
        let port = |base: u16| {
            base.checked_add(offset)
                .ok_or(PortAssignmentError::Overflow { index })
        };
        assignments.push(ChildPorts {
            api_port: port(base_api)?,
            stream_port: port(base_stream)?,
            debug_port: port(base_debug)?,
        });
    }
    Ok(assignments)
}
