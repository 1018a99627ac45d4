//! Synthetic fixtures for the loader, locator and resolver tests.
//!
//! Everything is built in memory: a v24.2 `global-metadata.dat` blob
//! with a handful of types, and a fake 64-bit binary with identity
//! address mapping carrying the registration structures.

use metadump_binary_parser::{
    BinaryFormat, Il2CppBinary, ParseError, ParseResult, SearchSection, SectionClassification,
};

fn w16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn w32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn wu32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Builds a minimal v24.2 metadata blob: one image (`mscorlib.dll`),
/// six type definitions (Object, Foo, List`1, String, Int32,
/// Foo.Inner), one method (`Foo.Bar(int)`), one generic container with
/// parameter `T`, one string literal and a default-value blob.
pub struct MetadataBuilder {
    strings: Vec<u8>,
}

/// Header (offset, size) pair order for the 264-byte v24.2 layout.
const PAIR_COUNT: usize = 32;
const P_STRING_LITERAL: usize = 0;
const P_STRING_LITERAL_DATA: usize = 1;
const P_STRING: usize = 2;
const P_METHODS: usize = 5;
const P_DEFAULT_VALUE_DATA: usize = 8;
const P_PARAMETERS: usize = 10;
const P_GENERIC_PARAMETERS: usize = 12;
const P_GENERIC_CONTAINERS: usize = 14;
const P_TYPE_DEFINITIONS: usize = 19;
const P_IMAGES: usize = 20;
const P_ASSEMBLIES: usize = 21;

impl MetadataBuilder {
    pub fn new() -> Self {
        Self {
            strings: Vec::new(),
        }
    }

    fn add_string(&mut self, s: &str) -> i32 {
        let offset = self.strings.len() as i32;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        offset
    }

    pub fn build(mut self) -> Vec<u8> {
        let s_empty = self.add_string("");
        let s_mscorlib_dll = self.add_string("mscorlib.dll");
        let s_system = self.add_string("System");
        let s_object = self.add_string("Object");
        let s_foo = self.add_string("Foo");
        let s_bar = self.add_string("Bar");
        let s_scg = self.add_string("System.Collections.Generic");
        let s_list = self.add_string("List`1");
        let s_t = self.add_string("T");
        let s_string = self.add_string("String");
        let s_int32 = self.add_string("Int32");
        let s_inner = self.add_string("Inner");
        let s_x = self.add_string("x");
        let s_mscorlib = self.add_string("mscorlib");

        // v24.2 type definition: 17 i32 fields, 8 u16 counts, bitfield,
        // token.
        let type_def = |name: i32,
                        namespace: i32,
                        byval: i32,
                        declaring: i32,
                        parent: i32,
                        generic_container: i32,
                        method_start: i32,
                        method_count: u16|
         -> Vec<u8> {
            let mut out = Vec::new();
            w32(&mut out, name);
            w32(&mut out, namespace);
            w32(&mut out, byval);
            w32(&mut out, byval); // byref mirrors byval here
            w32(&mut out, declaring);
            w32(&mut out, parent);
            w32(&mut out, -1); // element
            w32(&mut out, generic_container);
            wu32(&mut out, 0x0010_0001); // flags: public | beforefieldinit
            w32(&mut out, 0); // field_start
            w32(&mut out, method_start);
            for _ in 0..6 {
                w32(&mut out, -1); // event/property/nested/iface/vtable/iface-offset starts
            }
            w16(&mut out, method_count);
            for _ in 0..7 {
                w16(&mut out, 0);
            }
            wu32(&mut out, 0); // bitfield
            wu32(&mut out, 0x0200_0001); // token
            out
        };

        let mut type_defs = Vec::new();
        type_defs.extend(type_def(s_object, s_system, 0, -1, -1, -1, 0, 0));
        type_defs.extend(type_def(s_foo, s_empty, 1, -1, 0, -1, 0, 1));
        type_defs.extend(type_def(s_list, s_scg, 2, -1, 0, 0, 0, 0));
        type_defs.extend(type_def(s_string, s_system, 3, -1, 0, -1, 0, 0));
        type_defs.extend(type_def(s_int32, s_system, 4, -1, 0, -1, 0, 0));
        type_defs.extend(type_def(s_inner, s_empty, 6, 1, 0, -1, 0, 0));

        // Foo.Bar(int x): void — return type 8 (void record), one
        // parameter of type 9 (int record).
        let mut method_defs = Vec::new();
        w32(&mut method_defs, s_bar);
        w32(&mut method_defs, 1); // declaring type definition
        w32(&mut method_defs, 8); // return type (types index)
        w32(&mut method_defs, 0); // parameter_start
        w32(&mut method_defs, -1); // generic container
        wu32(&mut method_defs, 0x0600_0001); // token
        w16(&mut method_defs, 0x0006); // public
        w16(&mut method_defs, 0);
        w16(&mut method_defs, 0);
        w16(&mut method_defs, 1); // parameter count

        let mut parameters = Vec::new();
        w32(&mut parameters, s_x);
        wu32(&mut parameters, 0x0800_0001);
        w32(&mut parameters, 9); // int record

        let mut containers = Vec::new();
        w32(&mut containers, 2); // owner: List`1
        w32(&mut containers, 1); // one type argument
        w32(&mut containers, 0); // a type, not a method
        w32(&mut containers, 0); // first generic parameter

        let mut generic_params = Vec::new();
        w32(&mut generic_params, 0); // owner container
        w32(&mut generic_params, s_t);
        w16(&mut generic_params, 0);
        w16(&mut generic_params, 0);
        w16(&mut generic_params, 0);
        w16(&mut generic_params, 0);

        let mut images = Vec::new();
        w32(&mut images, s_mscorlib_dll);
        w32(&mut images, 0); // assembly
        w32(&mut images, 0); // type_start
        wu32(&mut images, 6); // type_count
        w32(&mut images, 0);
        wu32(&mut images, 0);
        w32(&mut images, -1); // entry point
        wu32(&mut images, 1); // token: 1 keeps the 24.1 probe quiet
        w32(&mut images, 0);
        wu32(&mut images, 0);

        // 68-byte v24.2 assembly entry (the 24.4 probe divides by 68).
        let mut assemblies = Vec::new();
        w32(&mut assemblies, 0); // image
        wu32(&mut assemblies, 1); // token
        w32(&mut assemblies, 0);
        w32(&mut assemblies, 0);
        w32(&mut assemblies, s_mscorlib);
        w32(&mut assemblies, s_empty);
        w32(&mut assemblies, -1); // hash value
        w32(&mut assemblies, s_empty);
        wu32(&mut assemblies, 0x8004); // SHA1
        w32(&mut assemblies, 0);
        wu32(&mut assemblies, 0);
        w32(&mut assemblies, 4);
        w32(&mut assemblies, 0);
        w32(&mut assemblies, 0);
        w32(&mut assemblies, 0);
        assemblies.extend_from_slice(&[0u8; 8]);

        let mut literals = Vec::new();
        wu32(&mut literals, 5);
        w32(&mut literals, 0);
        let literal_data = b"hello".to_vec();

        // Default-value payloads: an int32 7 at 0, a length-prefixed
        // string at 4.
        let mut default_data = Vec::new();
        w32(&mut default_data, 7);
        w32(&mut default_data, 5);
        default_data.extend_from_slice(b"howdy");

        let mut blob = vec![0u8; 8 + PAIR_COUNT * 8];
        blob[0..4].copy_from_slice(&super::metadata::METADATA_MAGIC.to_le_bytes());
        blob[4..8].copy_from_slice(&24i32.to_le_bytes());

        let mut set_pair = |blob: &mut Vec<u8>, pair: usize, table: &[u8]| {
            let offset = blob.len() as u32;
            blob.extend_from_slice(table);
            let at = 8 + pair * 8;
            blob[at..at + 4].copy_from_slice(&offset.to_le_bytes());
            blob[at + 4..at + 8].copy_from_slice(&(table.len() as i32).to_le_bytes());
        };

        // The string-literal table must come first: the 24.2 probe
        // keys on its offset being exactly the 264-byte header size.
        set_pair(&mut blob, P_STRING_LITERAL, &literals);
        set_pair(&mut blob, P_STRING_LITERAL_DATA, &literal_data);
        set_pair(&mut blob, P_STRING, &self.strings);
        set_pair(&mut blob, P_TYPE_DEFINITIONS, &type_defs);
        set_pair(&mut blob, P_METHODS, &method_defs);
        set_pair(&mut blob, P_PARAMETERS, &parameters);
        set_pair(&mut blob, P_GENERIC_CONTAINERS, &containers);
        set_pair(&mut blob, P_GENERIC_PARAMETERS, &generic_params);
        set_pair(&mut blob, P_IMAGES, &images);
        set_pair(&mut blob, P_ASSEMBLIES, &assemblies);
        set_pair(&mut blob, P_DEFAULT_VALUE_DATA, &default_data);
        blob
    }
}

/// 64-bit test binary with identity address mapping. Everything below
/// `exec_end` is classified executable, the rest initialized data.
pub struct FakeBinary {
    data: Vec<u8>,
    exec_end: u64,
    cursor: usize,
    is_dumped: bool,
}

impl FakeBinary {
    pub fn new(total: usize, exec_end: usize) -> Self {
        Self {
            data: vec![0u8; total],
            exec_end: exec_end as u64,
            cursor: exec_end,
            is_dumped: false,
        }
    }

    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> u64 {
        self.cursor = (self.cursor + 7) & !7;
        let va = self.cursor as u64;
        assert!(self.cursor + bytes.len() <= self.data.len(), "fixture overflow");
        self.data[self.cursor..self.cursor + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
        va
    }

    pub fn alloc_ptr(&mut self, value: u64) -> u64 {
        self.alloc_bytes(&value.to_le_bytes())
    }

    pub fn alloc_ptrs(&mut self, values: &[u64]) -> u64 {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        self.alloc_bytes(&bytes)
    }

    pub fn alloc_u32s(&mut self, values: &[u32]) -> u64 {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        self.alloc_bytes(&bytes)
    }
}

impl Il2CppBinary for FakeBinary {
    fn format(&self) -> BinaryFormat {
        BinaryFormat::Nso
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn is_32bit(&self) -> bool {
        false
    }

    fn is_dumped(&self) -> bool {
        self.is_dumped
    }

    fn set_dumped(&mut self, dumped: bool) {
        self.is_dumped = dumped;
    }

    fn va_to_offset(&self, va: u64) -> ParseResult<u64> {
        if va < self.data.len() as u64 {
            Ok(va)
        } else {
            Err(ParseError::AddressOutOfRange(va))
        }
    }

    fn offset_to_va(&self, offset: u64) -> u64 {
        offset
    }

    fn classify_sections(&self) -> SectionClassification {
        let exec = vec![SearchSection {
            offset: 0,
            offset_end: self.exec_end,
            address: 0,
            address_end: self.exec_end,
        }];
        let data = vec![SearchSection {
            offset: self.exec_end,
            offset_end: self.data.len() as u64,
            address: self.exec_end,
            address_end: self.data.len() as u64,
        }];
        SectionClassification {
            exec,
            bss: data.clone(),
            data,
        }
    }
}

/// Registration VAs of the assembled binary fixture.
pub struct FixtureAddresses {
    pub code_registration: u64,
    pub metadata_registration: u64,
    pub type_vas: Vec<u64>,
}

/// Assemble the binary side matching [`MetadataBuilder`]'s metadata:
/// nine type records, a `List<Int32>` generic class, two generic
/// insts, one method spec `Foo.Bar<String, List<Int32>>`, one code-gen
/// module and both registration roots.
pub fn build_binary_fixture() -> (FakeBinary, FixtureAddresses) {
    let mut binary = FakeBinary::new(0x4000, 0x800);

    let class = |datapoint: u64| -> Vec<u8> {
        let mut record = datapoint.to_le_bytes().to_vec();
        record.extend_from_slice(&(0x12u32 << 16).to_le_bytes());
        record
    };
    let record = |datapoint: u64, kind: u32| -> Vec<u8> {
        let mut record = datapoint.to_le_bytes().to_vec();
        record.extend_from_slice(&(kind << 16).to_le_bytes());
        record
    };

    // Plain class/valuetype records first.
    let t0 = binary.alloc_bytes(&class(0)); // Object
    let t1 = binary.alloc_bytes(&class(1)); // Foo
    let t2 = binary.alloc_bytes(&class(2)); // List`1 (open)
    let t3 = binary.alloc_bytes(&class(3)); // String
    let t4 = binary.alloc_bytes(&record(4, 0x11)); // Int32 (valuetype)

    // List<Int32>: a generic inst over [Int32], hung off the generic
    // class record.
    let argv0 = binary.alloc_ptrs(&[t4]);
    let gi0 = binary.alloc_ptrs(&[1, argv0]); // type_argc, type_argv
    let gc = binary.alloc_ptrs(&[2, gi0, 0, 0]); // type def index, context, cached

    let t5 = binary.alloc_bytes(&record(gc, 0x15)); // GENERICINST
    let t6 = binary.alloc_bytes(&class(5)); // Foo.Inner
    let t7 = binary.alloc_bytes(&record(t4, 0x1D)); // Int32[] (szarray)
    let t8 = binary.alloc_bytes(&record(0, 0x01)); // void
    let t9 = binary.alloc_bytes(&record(0, 0x08)); // int
    let t10 = binary.alloc_bytes(&record(0, 0x0E)); // string

    let type_vas = vec![t0, t1, t2, t3, t4, t5, t6, t7, t8, t9, t10];
    let types_array = binary.alloc_ptrs(&type_vas);

    // <String, List<Int32>> for the method spec.
    let argv1 = binary.alloc_ptrs(&[t3, t5]);
    let gi1 = binary.alloc_ptrs(&[2, argv1]);
    let generic_insts = binary.alloc_ptrs(&[gi0, gi1]);
    let generic_classes = binary.alloc_ptrs(&[gc]);

    // Method spec (method 0, class inst -1, method inst 1) and the
    // generic-method table entry binding it to pointer slot 0.
    let mut spec = Vec::new();
    w32(&mut spec, 0);
    w32(&mut spec, -1);
    w32(&mut spec, 1);
    let method_specs = binary.alloc_bytes(&spec);
    let mut table = Vec::new();
    w32(&mut table, 0); // generic_method_index
    w32(&mut table, 0); // indices.method_index
    w32(&mut table, 0); // indices.invoker_index
    let generic_method_table = binary.alloc_bytes(&table);
    let generic_method_pointers = binary.alloc_ptrs(&[0x1234]);
    let invoker_pointers = binary.alloc_ptrs(&[0x1111]);

    // Per-type field-offset tables (six type definitions).
    let foo_offsets = binary.alloc_u32s(&[16, 24]);
    let mut offset_tables = vec![0u64; 6];
    offset_tables[1] = foo_offsets;
    let field_offsets = binary.alloc_ptrs(&offset_tables);
    let type_definition_sizes = binary.alloc_ptrs(&[0, 0, 0, 0, 0, 0]);

    // One code-gen module named after the image.
    let module_name = binary.alloc_bytes(b"mscorlib.dll\0");
    let module_method_pointers = binary.alloc_ptrs(&[0x4141]);
    let module_invoker_indices = binary.alloc_u32s(&[0]);
    let module = binary.alloc_ptrs(&[
        module_name,
        1,
        module_method_pointers,
        module_invoker_indices,
        0, // reverse pinvoke count
        0, // reverse pinvoke indices
        0, // rgctx ranges count
        0, // rgctx ranges
        0, // rgctxs count
        0, // rgctxs
        0, // debugger metadata
    ]);
    let modules_array = binary.alloc_ptrs(&[module]);

    // v24.2 Il2CppCodeRegistration: 14 pointer slots.
    let code_registration = binary.alloc_ptrs(&[
        0, // reverse pinvoke count
        0,
        1, // generic method pointers
        generic_method_pointers,
        1, // invoker pointers
        invoker_pointers,
        0, // custom attribute generators
        0,
        0, // unresolved virtual calls
        0,
        1, // interop data
        0,
        1, // code-gen modules
        modules_array,
    ]);

    // v24.2 Il2CppMetadataRegistration: 16 pointer slots.
    let metadata_registration = binary.alloc_ptrs(&[
        1,
        generic_classes,
        2,
        generic_insts,
        1,
        generic_method_table,
        type_vas.len() as u64,
        types_array,
        1,
        method_specs,
        6,
        field_offsets,
        6,
        type_definition_sizes,
        0,
        0,
    ]);

    (
        binary,
        FixtureAddresses {
            code_registration,
            metadata_registration,
            type_vas,
        },
    )
}
