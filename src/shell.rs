//! Interactive shell over a mounted filesystem: `ls`, `cd`, `cat`, `dump`,
//! and friends, modeled on the original dumper's REPL.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::Result;

use efs2::fs::{Filesystem, OpenResult};
use efs2::inode::{is_dir, S_IFMT};

fn format_mode(mode: u32) -> String {
    let type_char = match mode & S_IFMT {
        efs2::inode::S_IFDIR => 'd',
        efs2::inode::S_IFLNK => 'l',
        _ => '-',
    };
    let bits = [
        (0o400, 'r'), (0o200, 'w'), (0o100, 'x'),
        (0o040, 'r'), (0o020, 'w'), (0o010, 'x'),
        (0o004, 'r'), (0o002, 'w'), (0o001, 'x'),
    ];
    let mut s = String::with_capacity(10);
    s.push(type_char);
    for (mask, ch) in bits {
        s.push(if mode & mask != 0 { ch } else { '-' });
    }
    s
}

fn hexdump(data: &[u8]) {
    for (i, chunk) in data.chunks(16).enumerate() {
        print!("{:08x}  ", i * 16);
        for b in chunk {
            print!("{b:02x} ");
        }
        for _ in chunk.len()..16 {
            print!("   ");
        }
        print!(" ");
        for &b in chunk {
            let c = b as char;
            print!("{}", if c.is_ascii_graphic() || c == ' ' { c } else { '.' });
        }
        println!();
    }
}

fn read_whole(fs: &Filesystem, path: &str) -> Result<Vec<u8>> {
    match fs.open(path, true)? {
        OpenResult::File(mut r) => {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            Ok(buf)
        }
        OpenResult::SymlinkTarget(data) => Ok(data),
    }
}

fn dump_one(fs: &Filesystem, src: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = read_whole(fs, src)?;
    fs::write(dest, data)?;
    Ok(())
}

fn dump_recursive(fs: &Filesystem, base: &str, dest_dir: &Path) -> Result<()> {
    for (full, inode) in fs.ls_recursive(base)? {
        if is_dir(inode.mode) {
            continue;
        }
        let rel = full.strip_prefix(base).unwrap_or(&full).trim_start_matches('/');
        dump_one(fs, &full, &dest_dir.join(rel))?;
    }
    Ok(())
}

pub fn run(mut fs: Filesystem, source_name: &str) -> Result<()> {
    println!("EFS2 shell");
    println!("source file: {} @ {:#010x}", source_name, fs.base_offset());

    let stdin = io::stdin();
    loop {
        print!("[{}]> ", fs.pwd());
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let cmd: Vec<&str> = line.split_whitespace().collect();
        if cmd.is_empty() {
            continue;
        }

        let result: Result<()> = (|| {
            match cmd[0] {
                "exit" => std::process::exit(0),
                "ls" | "dir" => {
                    let targets: Vec<&str> = if cmd.len() <= 1 { vec![""] } else { cmd[1..].to_vec() };
                    let multi = targets.len() > 1;
                    for t in targets {
                        if multi {
                            println!("{t}:");
                        }
                        for (name, info) in fs.ls(t)? {
                            if name == "." || name == ".." {
                                continue;
                            }
                            let mtime = info.modified_time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_default();
                            let ctime = info.created_time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_default();
                            println!("{}  {}  {}  {}", format_mode(info.mode), mtime, ctime, name);
                        }
                    }
                }
                "cd" => {
                    if cmd.len() > 2 {
                        println!("cd: too many arguments");
                    } else if cmd.len() == 2 {
                        fs.cd(cmd[1])?;
                    }
                }
                "dump" => {
                    if cmd.len() != 3 {
                        println!("dump: usage: dump filename destination");
                    } else if let Some(base) = cmd[1].strip_suffix('*') {
                        dump_recursive(&fs, base, Path::new(cmd[2]))?;
                    } else {
                        dump_one(&fs, cmd[1], Path::new(cmd[2]))?;
                    }
                }
                "pwd" => println!("{}", fs.pwd()),
                "encoding" => {
                    if cmd.len() == 1 {
                        println!("{}", fs.encoding().name());
                    } else if cmd.len() > 2 {
                        println!("encoding: too many arguments");
                    } else {
                        let enc = encoding_rs::Encoding::for_label(cmd[1].as_bytes())
                            .ok_or_else(|| anyhow::anyhow!("unknown encoding {:?}", cmd[1]))?;
                        fs.set_encoding(enc);
                    }
                }
                "cat" => {
                    if cmd.len() == 1 {
                        println!("cat: usage: cat files...");
                    } else {
                        let stdout = io::stdout();
                        let mut lock = stdout.lock();
                        for f in &cmd[1..] {
                            lock.write_all(&read_whole(&fs, f)?)?;
                        }
                    }
                }
                "hd" | "hexdump" => {
                    if cmd.len() == 1 {
                        println!("hexdump: usage: hexdump files...");
                    } else {
                        for f in &cmd[1..] {
                            hexdump(&read_whole(&fs, f)?);
                        }
                    }
                }
                "file" => {
                    if cmd.len() == 1 {
                        println!("file: usage: file files...");
                    } else {
                        for f in &cmd[1..] {
                            let t = fs.stat(f)?;
                            println!("{f}: ");
                            println!("    size: {} bytes", t.file_size);
                            println!("    modified time: {:?}", t.modified_time);
                            println!("    created time: {:?}", t.created_time);
                            println!("    number of blocks: {}", t.blocks);
                            println!("    generation: {}", t.generation);
                        }
                    }
                }
                "help" => {
                    println!("ls [files...] (list all files and folders in this directory)");
                    println!("dir [files...] (ditto)");
                    println!("cd [dir] (change the working directory)");
                    println!("dump [filename*] destination (read files and save)");
                    println!("pwd (get the current working directory)");
                    println!("encoding [encoding] (set the encoding used to read node filenames)");
                    println!("cat files... (read files and output to console)");
                    println!("hexdump files... (read files and output in hexdump)");
                    println!("hd files... (short for hexdump)");
                    println!("file files... (get file info)");
                    println!("help (show this help message)");
                }
                other => println!("{other}: command not found"),
            }
            Ok(())
        })();

        if let Err(e) = result {
            println!("{}: {}", cmd[0], e);
        }
    }

    Ok(())
}
