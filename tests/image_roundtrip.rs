//! End-to-end tests: compile synthetic bytecode files, write images and read them back.

use oatforge::{
    image::{Bin, ImageHeader, ImageSection, StorageMode, DEFAULT_IMAGE_BEGIN, PAGE_SIZE},
    prelude::*,
    runtime::NativePtr,
    utils::read_le,
};

const POINT: &str = "Lroundtrip/Point;";
const HOLDER: &str = "Lroundtrip/Holder;";
const OBJECT: &str = "Ljava/lang/Object;";

fn ctor_flags() -> AccessFlags {
    AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR
}

#[allow(clippy::cast_possible_truncation)]
fn boot_dex() -> DexFile {
    let mut dex = DexFileBuilder::new("roundtrip.dex");
    let object_init = dex.method_id(OBJECT, "<init>", "V") as u16;
    let ctor = CodeBuilder::new(1, 1)
        .invoke(Opcode::INVOKE_DIRECT, &[0], object_init)
        .return_void()
        .build();
    let sum = CodeBuilder::new(3, 2).add_int(0, 1, 2).return_value(0).build();

    dex.class(POINT)
        .access_flags(AccessFlags::PUBLIC)
        .superclass(OBJECT)
        .instance_field("x", "I", AccessFlags::PUBLIC)
        .instance_field("y", "I", AccessFlags::PUBLIC)
        .direct_method("<init>", "V", ctor_flags(), Some(ctor.clone()))
        .direct_method("sum", "III", AccessFlags::PUBLIC | AccessFlags::STATIC, Some(sum))
        .virtual_method("nativeHash", "I", AccessFlags::PUBLIC | AccessFlags::NATIVE, None)
        .finish();
    dex.class(HOLDER)
        .superclass(OBJECT)
        .static_field("instance", "Ljava/lang/Object;", AccessFlags::STATIC)
        .direct_method("<init>", "V", ctor_flags(), Some(ctor))
        .finish();
    dex.build()
}

fn boot_driver() -> Result<CompilerDriver> {
    let runtime = Runtime::new(vec![boot_dex()])?;
    let files = runtime.class_linker().boot_class_path().to_vec();
    let options = CompilerOptions {
        thread_count: 1,
        abort_on_hard_verifier_failure: false,
        ..CompilerOptions::boot_image()
    };
    let driver = CompilerDriver::with_stub_backend(options, runtime, files)?;
    driver.compile_all()?;
    Ok(driver)
}

fn read_u32(data: &[u8], offset: u32) -> u32 {
    read_le::<u32>(&data[offset as usize..]).unwrap()
}

#[test]
fn test_boot_image_file_round_trips() -> Result<()> {
    let driver = boot_driver()?;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("boot.art");

    let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image())?;
    writer.prepare_image_address_space()?;
    writer.write(&[&path])?;

    let bytes = std::fs::read(&path).unwrap();
    let header = ImageHeader::read(&bytes)?;
    let info = writer.image_info(0);

    assert_eq!(header.image_begin, DEFAULT_IMAGE_BEGIN);
    assert_eq!(header.image_size, info.image_size());
    assert_eq!(header.storage_mode, StorageMode::Uncompressed);
    assert!(!header.is_app_image);
    assert_eq!(header.data_size as usize, info.image_size() as usize - ImageHeader::SIZE);
    assert_ne!(header.image_roots, 0);

    let payload = &bytes[ImageHeader::SIZE..ImageHeader::SIZE + header.data_size as usize];
    assert_eq!(payload, &info.image_data()[ImageHeader::SIZE..]);

    let bitmap = header.section(ImageSection::ImageBitmap);
    assert_eq!(bitmap.offset as usize % PAGE_SIZE, 0);
    assert_eq!(bytes.len(), (bitmap.offset + bitmap.size) as usize);
    assert_eq!(&bytes[bitmap.offset as usize..], info.bitmap());
    Ok(())
}

#[test]
fn test_native_structures_follow_objects() -> Result<()> {
    let driver = boot_driver()?;
    let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image())?;
    writer.prepare_image_address_space()?;

    let info = writer.image_info(0);
    assert!(!writer.native_relocations().is_empty());
    for (ptr, relocation) in writer.native_relocations() {
        assert!(
            relocation.offset >= info.image_end(),
            "{ptr:?} placed at {:#x} inside the object section",
            relocation.offset
        );
        assert!(relocation.offset < info.image_size());
    }
    assert_eq!(info.section(ImageSection::Objects).end(), info.image_end());
    Ok(())
}

#[test]
fn test_mirror_bins_account_for_every_object() -> Result<()> {
    let driver = boot_driver()?;
    let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image())?;
    writer.prepare_image_address_space()?;

    let mut object_bytes = 0usize;
    let mut objects = 0usize;
    {
        let runtime = driver.runtime().read().unwrap();
        runtime.heap().visit_objects(|id, object| {
            assert_eq!(writer.oat_index_of(id), Some(0), "{id:?} was not placed");
            object_bytes += object.size();
            objects += 1;
        });
    }

    let sizes = writer.bin_slot_sizes(0);
    let mirror_bytes: u32 = sizes[..Bin::MIRROR_COUNT].iter().sum();
    assert_eq!(mirror_bytes as usize, object_bytes);
    assert_eq!(
        writer.image_info(0).image_end(),
        ImageWriter::OBJECTS_BEGIN + mirror_bytes
    );

    let slots: u32 = (0..Bin::MIRROR_COUNT)
        .filter_map(Bin::from_index)
        .map(|bin| writer.image_info(0).bin_slot_count(bin))
        .sum();
    assert_eq!(slots as usize, objects);
    assert!(sizes[Bin::ClassInitializedFinalStatics.index()] > 0);
    assert!(sizes[Bin::String.index()] > 0);
    Ok(())
}

#[test]
fn test_written_image_is_relocated() -> Result<()> {
    let driver = boot_driver()?;
    let dir = tempfile::tempdir().unwrap();
    let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image())?;
    writer.prepare_image_address_space()?;
    writer.write(&[dir.path().join("boot.art")])?;

    let begin = writer.image_info(0).image_begin();
    let image = writer.image_info(0).image_data();
    let runtime = driver.runtime().read().unwrap();

    runtime.heap().visit_objects(|id, object| {
        let offset = writer.get_image_address(id) - begin;
        assert_eq!(read_u32(image, offset), writer.get_image_address(object.class()));
        for &(slot, referent) in object.references() {
            let expected = referent.map_or(0, |r| writer.get_image_address(r));
            assert_eq!(read_u32(image, offset + slot), expected, "{id:?} slot {slot}");
        }
    });

    let linker = runtime.class_linker();
    let mut methods = 0;
    for (&ptr, relocation) in writer.native_relocations() {
        if let NativePtr::Method(method) = ptr {
            let class = linker.class(linker.method(method).declaring_class());
            assert_eq!(
                read_u32(image, relocation.offset),
                writer.get_image_address(class.mirror())
            );
            methods += 1;
        }
    }
    assert!(methods > 0);
    Ok(())
}

#[test]
fn test_native_method_records_are_dirty() -> Result<()> {
    let driver = boot_driver()?;
    let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image())?;
    writer.prepare_image_address_space()?;

    let runtime = driver.runtime().read().unwrap();
    let point = runtime.class_linker().lookup_class(POINT, None).unwrap();
    let relocation = writer.native_relocations()[&NativePtr::MethodArray(point)];
    assert_eq!(relocation.kind.bin(), Bin::ArtMethodDirty);
    Ok(())
}

#[test]
fn test_compressed_payload_decompresses_to_image() -> Result<()> {
    let driver = boot_driver()?;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("boot.art");
    let options = ImageWriterOptions {
        storage_mode: StorageMode::Lz4,
        verify_compression: true,
        ..ImageWriterOptions::boot_image()
    };

    let mut writer = ImageWriter::new(&driver, options)?;
    writer.prepare_image_address_space()?;
    writer.write(&[&path])?;

    let bytes = std::fs::read(&path).unwrap();
    let header = ImageHeader::read(&bytes)?;
    assert_eq!(header.storage_mode, StorageMode::Lz4);

    let info = writer.image_info(0);
    let stored = &bytes[ImageHeader::SIZE..ImageHeader::SIZE + header.data_size as usize];
    let payload = lz4_flex::block::decompress(stored, info.image_size() as usize - ImageHeader::SIZE)
        .unwrap();
    assert_eq!(payload, &info.image_data()[ImageHeader::SIZE..]);
    Ok(())
}

#[test]
fn test_high_compression_payload_decompresses_to_image() -> Result<()> {
    let driver = boot_driver()?;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("boot.art");
    let mut writer = ImageWriter::new(
        &driver,
        ImageWriterOptions {
            storage_mode: StorageMode::Lz4Hc,
            verify_compression: true,
            ..ImageWriterOptions::boot_image()
        },
    )?;
    writer.prepare_image_address_space()?;
    writer.write(&[&path])?;

    let bytes = std::fs::read(&path).unwrap();
    let header = ImageHeader::read(&bytes)?;
    assert_eq!(header.storage_mode, StorageMode::Lz4Hc);

    let info = writer.image_info(0);
    let image_len = info.image_size() as usize - ImageHeader::SIZE;
    let stored = &bytes[ImageHeader::SIZE..ImageHeader::SIZE + header.data_size as usize];
    let payload = lz4::block::decompress(stored, Some(i32::try_from(image_len).unwrap())).unwrap();
    assert_eq!(payload, &info.image_data()[ImageHeader::SIZE..]);
    assert_eq!(lz4_flex::block::decompress(stored, image_len).unwrap(), payload);
    Ok(())
}

#[test]
fn test_write_requires_prepared_layout() -> Result<()> {
    let driver = boot_driver()?;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("boot.art");

    let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image())?;
    assert!(writer.write(&[&path]).is_err());
    assert!(!path.exists());

    writer.prepare_image_address_space()?;
    assert!(writer.prepare_image_address_space().is_err());
    assert!(writer.write(&[&path, &path]).is_err());
    Ok(())
}

#[test]
fn test_app_image_layers_on_boot_image() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let boot = boot_driver()?;
    let layout = {
        let mut writer = ImageWriter::new(&boot, ImageWriterOptions::boot_image())?;
        writer.prepare_image_address_space()?;
        writer.write(&[dir.path().join("boot.art")])?;
        writer.boot_image_layout()
    };
    assert!(layout.num_objects() > 0);

    let mut runtime = boot.into_runtime();
    runtime.mark_boot_image_space();
    let mut dex = DexFileBuilder::new("app.dex");
    dex.class("Lapp/Main;")
        .superclass(POINT)
        .instance_field("z", "I", AccessFlags::PUBLIC)
        .finish();
    let (_, files) = runtime.create_class_loader(vec![dex.build()])?;

    let options = CompilerOptions {
        thread_count: 1,
        ..CompilerOptions::app_image()
    };
    let driver = CompilerDriver::with_stub_backend(options, runtime, files)?;
    driver.compile_all()?;

    let path = dir.path().join("app.art");
    let mut writer = ImageWriter::new(&driver, ImageWriterOptions::app_image(layout.clone()))?;
    writer.prepare_image_address_space()?;
    writer.write(&[&path])?;

    let header = ImageHeader::read(&std::fs::read(&path).unwrap())?;
    assert!(header.is_app_image);
    assert!(header.compile_pic);
    assert_eq!(header.boot_image_begin, layout.image_begin);
    assert_eq!(header.boot_image_size, layout.image_size);
    assert!(header.image_begin >= layout.end());
    assert_eq!(header.image_begin as usize % PAGE_SIZE, 0);

    let runtime = driver.runtime().read().unwrap();
    let main = runtime
        .class_linker()
        .classes()
        .find(|(_, class)| class.descriptor() == "Lapp/Main;")
        .map(|(_, class)| class.mirror())
        .unwrap();
    assert!(writer.get_image_address(main) >= header.image_begin);
    let object = runtime.class_linker().lookup_class(OBJECT, None).unwrap();
    let object_mirror = runtime.class_linker().class(object).mirror();
    assert_eq!(
        writer.get_image_address(object_mirror),
        layout.object_address(object_mirror).unwrap()
    );
    Ok(())
}
