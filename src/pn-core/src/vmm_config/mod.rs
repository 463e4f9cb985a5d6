pub mod vm_spec;
