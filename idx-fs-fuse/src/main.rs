use clap::{App, Arg};
use idx_fs::config::DEFAULT_TOTAL_SECTORS;
use idx_fs::{BlockDevice, FileSystem, FsConfig, SECTOR_SIZE};
use std::fs::{read_dir, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::Mutex;

struct BlockFile(Mutex<File>);

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start((block_id * SECTOR_SIZE) as u64))
            .and_then(|_| file.read_exact(buf))
            .unwrap_or_else(|e| panic!("can't read sector {}: {}", block_id, e));
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.0.lock().unwrap_or_else(|e| e.into_inner());
        file.seek(SeekFrom::Start((block_id * SECTOR_SIZE) as u64))
            .and_then(|_| file.write_all(buf))
            .unwrap_or_else(|e| panic!("can't write sector {}: {}", block_id, e));
    }
}

fn open_image(path: &str, total_sectors: u32) -> io::Result<Arc<BlockFile>> {
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    f.set_len(total_sectors as u64 * SECTOR_SIZE as u64)?;
    Ok(Arc::new(BlockFile(Mutex::new(f))))
}

fn invalid_input(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn main() -> io::Result<()> {
    idx_fs_pack()
}

fn idx_fs_pack() -> io::Result<()> {
    let matches = App::new("IdxFileSystem packer")
        .arg(
            Arg::with_name("source")
                .short("s")
                .long("source")
                .takes_value(true)
                .required(true)
                .help("Source dir of the files to pack (with backslash)"),
        )
        .arg(
            Arg::with_name("target")
                .short("t")
                .long("target")
                .takes_value(true)
                .required(true)
                .help("Target dir of fs.img (with backslash)"),
        )
        .arg(
            Arg::with_name("sectors")
                .short("n")
                .long("sectors")
                .takes_value(true)
                .help("Device size in sectors"),
        )
        .get_matches();
    let src_path = matches.value_of("source").unwrap_or_default();
    let target_path = matches.value_of("target").unwrap_or_default();
    let total_sectors = match matches.value_of("sectors") {
        Some(n) => n
            .parse::<u32>()
            .map_err(|e| invalid_input(format!("bad sector count {}: {}", n, e)))?,
        None => DEFAULT_TOTAL_SECTORS,
    };
    println!("src_path = {}\ntarget_path = {}", src_path, target_path);

    let image = format!("{}{}", target_path, "fs.img");
    let config = FsConfig::new(total_sectors);
    let fs = FileSystem::format(open_image(&image, total_sectors)?, config);

    let mut packed = Vec::new();
    for dir_entry in read_dir(src_path)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let name = dir_entry.file_name().to_string_lossy().into_owned();
        let mut all_data: Vec<u8> = Vec::new();
        File::open(dir_entry.path())?.read_to_end(&mut all_data)?;
        let sector = fs
            .create_inode(0, false)
            .map_err(|e| invalid_input(format!("{}: {}", name, e)))?;
        let inode = fs.open_inode(sector);
        let written = inode.write_at(0, &all_data);
        inode.close();
        if written != all_data.len() {
            return Err(invalid_input(format!(
                "{}: only {} of {} bytes fit",
                name,
                written,
                all_data.len()
            )));
        }
        println!("{} -> {}", name, sector);
        packed.push((sector, all_data));
    }
    fs.unmount();

    // read everything back through a fresh mount
    let fs = FileSystem::mount(open_image(&image, total_sectors)?, config);
    for (sector, data) in packed.iter() {
        let inode = fs.open_inode(*sector);
        let mut buf = vec![0u8; inode.length()];
        inode.read_at(0, &mut buf);
        inode.close();
        if buf != *data {
            return Err(invalid_input(format!("inode {} does not match its source", sector)));
        }
    }
    println!(
        "{} file(s) packed, {} of {} sectors free",
        packed.len(),
        fs.free_map().free_count(),
        total_sectors
    );
    fs.unmount();
    Ok(())
}

#[test]
fn idx_fs_test() -> std::io::Result<()> {
    let image = std::env::temp_dir().join("idx-fs-test.img");
    let block_file = open_image(&image.to_string_lossy(), 4096)?;
    let config = FsConfig::new(4096).with_cache_slots(16);
    FileSystem::format(block_file.clone(), config).unmount();
    let fs = FileSystem::mount(block_file.clone(), config);
    let root_inode = fs.root_inode();
    assert!(root_inode.is_directory());

    let sector = fs.create_inode(0, false).unwrap();
    let filea = fs.open_inode(sector);
    let greet_str = "Hello, world!";
    filea.write_at(0, greet_str.as_bytes());
    let mut buffer = [0u8; 233];
    let len = filea.read_at(0, &mut buffer);
    assert_eq!(greet_str, core::str::from_utf8(&buffer[..len]).unwrap(),);
    filea.close();

    let mut random_str_test = |len: usize| {
        let free = fs.free_map().free_count();
        let sector = fs.create_inode(0, false).unwrap();
        let file = fs.open_inode(sector);
        assert_eq!(file.read_at(0, &mut buffer), 0,);
        let mut str = String::new();
        use rand;
        // random digit
        for _ in 0..len {
            str.push(char::from('0' as u8 + rand::random::<u8>() % 10));
        }
        file.write_at(0, str.as_bytes());
        let mut read_buffer = [0u8; 127];
        let mut offset = 0usize;
        let mut read_str = String::new();
        loop {
            let len = file.read_at(offset, &mut read_buffer);
            if len == 0 {
                break;
            }
            offset += len;
            read_str.push_str(core::str::from_utf8(&read_buffer[..len]).unwrap());
        }
        assert_eq!(str, read_str);
        file.remove();
        file.close();
        assert_eq!(fs.free_map().free_count(), free);
    };

    random_str_test(4 * SECTOR_SIZE);
    random_str_test(8 * SECTOR_SIZE + SECTOR_SIZE / 2);
    random_str_test(100 * SECTOR_SIZE);
    random_str_test(70 * SECTOR_SIZE + SECTOR_SIZE / 7);
    random_str_test((12 + 128) * SECTOR_SIZE);
    random_str_test(400 * SECTOR_SIZE);
    random_str_test(1000 * SECTOR_SIZE);
    random_str_test(2000 * SECTOR_SIZE);

    root_inode.close();
    fs.unmount();
    Ok(())
}
