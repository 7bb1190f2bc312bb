//! Builtin resource schemas.

use super::field::{FieldSpec, Normalizer, ValueKind};
use super::resource::ResourceSchema;

/// Resource type name of the builtin virtual-machine schema.
pub const VIRTUAL_MACHINE: &str = "virtual_machine";

/// Schema of a cloud virtual machine.
///
/// Identity fields (`name`, `location`, `resource_group_name`) force
/// replacement; everything else is updated in place. Disk and profile blocks
/// are single nested blocks, data disks are a set identified by their
/// non-computed fields.
#[must_use]
pub fn virtual_machine() -> ResourceSchema {
    ResourceSchema::new()
        .with_field("id", FieldSpec::string().computed_only())
        .with_field("name", FieldSpec::string().required().forces_replacement())
        .with_field(
            "location",
            FieldSpec::string()
                .required()
                .forces_replacement()
                .normalized(Normalizer::Location),
        )
        .with_field(
            "resource_group_name",
            FieldSpec::string().required().forces_replacement(),
        )
        .with_field(
            "plan",
            FieldSpec::block([
                ("name", FieldSpec::string().required()),
                ("publisher", FieldSpec::string().required()),
                ("product", FieldSpec::string().required()),
            ])
            .optional_computed(),
        )
        .with_field("availability_set_id", FieldSpec::string().optional_computed())
        .with_field("vm_size", FieldSpec::string().required())
        .with_field(
            "storage_image_reference",
            FieldSpec::block([
                ("publisher", FieldSpec::string().required()),
                ("offer", FieldSpec::string().required()),
                ("sku", FieldSpec::string().required()),
                ("version", FieldSpec::string().required()),
            ])
            .optional_computed(),
        )
        .with_field(
            "storage_os_disk",
            FieldSpec::block([
                ("name", FieldSpec::string().required()),
                ("vhd_uri", FieldSpec::string().required()),
                ("caching", FieldSpec::string().optional_computed()),
                ("create_option", FieldSpec::string().required()),
            ])
            .required(),
        )
        .with_field(
            "storage_data_disk",
            FieldSpec::set(data_disk()).optional_computed(),
        )
        .with_field(
            "os_profile",
            FieldSpec::block([
                ("computer_name", FieldSpec::string().optional_computed()),
                ("admin_username", FieldSpec::string().required()),
                ("admin_password", FieldSpec::string().required()),
                ("custom_data", FieldSpec::string().optional_computed()),
            ])
            .required(),
        )
        .with_field(
            "network_interface_ids",
            FieldSpec::set(ValueKind::String).required(),
        )
        .with_field("tags", FieldSpec::map(ValueKind::String))
}

fn data_disk() -> ValueKind {
    FieldSpec::block([
        ("name", FieldSpec::string().required()),
        ("vhd_uri", FieldSpec::string().required()),
        ("create_option", FieldSpec::string().required()),
        ("disk_size_gb", FieldSpec::number().required()),
        ("lun", FieldSpec::number().required()),
    ])
    .kind
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Mutability;

    #[test]
    fn test_virtual_machine_schema_shape() {
        let schema = virtual_machine();
        let required: Vec<_> = schema.required_fields().collect();
        assert_eq!(
            required,
            vec![
                "location",
                "name",
                "network_interface_ids",
                "os_profile",
                "resource_group_name",
                "storage_os_disk",
                "vm_size",
            ]
        );
        assert!(schema.field("id").unwrap().is_computed_only());
        assert_eq!(schema.field("vm_size").unwrap().mutability, Mutability::Mutable);
        assert!(schema.field("storage_data_disk").unwrap().defers_to_remote());
    }
}
