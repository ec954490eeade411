//! Database entities

pub mod virtual_machine;

pub use virtual_machine::Entity as VirtualMachine;

pub mod prelude {
    pub use super::virtual_machine::Entity as VirtualMachine;
}
